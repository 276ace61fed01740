pub mod analyzer;
pub mod breaker;
pub mod cache;
pub mod gatherer;
pub mod generator;
pub mod prompt;
pub mod repair;
pub mod search;
pub mod updater;
pub mod validator;
