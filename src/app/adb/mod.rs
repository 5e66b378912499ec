pub mod command;
pub mod locator;
pub mod parse;
pub mod paths;
pub mod runner;
pub mod server;
pub mod transfer;
