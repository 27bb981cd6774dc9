pub mod account;
pub mod email;
