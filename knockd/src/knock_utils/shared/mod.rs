pub mod helper;
pub mod types_and_config;
