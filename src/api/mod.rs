pub(crate) mod output;
pub(crate) mod rule;
pub(crate) mod server;
