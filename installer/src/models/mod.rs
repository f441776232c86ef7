pub mod env_file;
pub mod stack_config;
