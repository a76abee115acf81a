pub mod bed;
pub mod config;
pub mod fimo;
pub mod genome;
pub mod identifiers;
pub mod motif;
pub mod network;
pub mod pipeline;
pub mod tfbs;
pub mod utils;
