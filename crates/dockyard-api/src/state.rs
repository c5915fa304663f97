//! Application state.

use dockyard_scheduler::Context;
use std::ops::Deref;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    context: Context,
}

impl AppState {
    pub fn new(context: Context) -> Self {
        Self { context }
    }
}

impl Deref for AppState {
    type Target = Context;

    fn deref(&self) -> &Context {
        &self.context
    }
}
