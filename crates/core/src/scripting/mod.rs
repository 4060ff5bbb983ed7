//! Subprocess management for plugin scripts and external tools.
//!
//! Plugins that live outside the binary are executables that read one JSON
//! request from stdin and answer on stdout. The same runner drives other
//! external programs (e.g. `gpg` for signing), which take raw bytes instead.
//! Nothing here touches the database.

pub mod executor;
pub mod plugin;
pub mod subprocess;
