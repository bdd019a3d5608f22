pub(crate) mod data;
pub(crate) mod runtime;
pub mod util;
