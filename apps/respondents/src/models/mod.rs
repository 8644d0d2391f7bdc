pub mod consent;
pub mod context;
pub mod event;
pub mod participation;
pub mod requirements;
pub mod respondent;
pub mod user;
