pub mod delegation;
pub mod history;
pub mod request;
pub mod step;
pub mod workflow;
