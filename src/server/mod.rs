pub(crate) mod builder;
pub(crate) mod handler;
pub(crate) mod matchers;
pub(crate) mod server;
pub(crate) mod state;
