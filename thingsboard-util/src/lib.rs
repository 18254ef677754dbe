pub mod http;
pub mod interrupt;
pub mod json;
pub mod types;
