//! Terminal front end for the trusted client.

/// Ratatui gain console.
pub mod ui;
