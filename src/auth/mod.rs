pub mod cipher;
pub mod connector;
pub mod oauth;
pub mod token_store;
pub mod vault;
