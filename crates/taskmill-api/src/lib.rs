//! Management-facing API server for Taskmill.
//!
//! A read-mostly HTTP surface over the coordination schema: job CRUD,
//! "Run Now", dispatch and log listings, and the active-workers view. The
//! scheduler and workers never talk to this service; they share only the
//! database with it.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
