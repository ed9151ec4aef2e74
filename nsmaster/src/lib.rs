//! The namespace master daemon: configuration loading, recovery and the
//! background loop around a [`libnamespace::NamespaceMaster`].

pub mod cli;
pub mod config;
pub mod daemon;
