pub mod book;
pub mod config;
pub mod io;
pub mod state;
