pub(crate) mod base;
pub(crate) mod fanout;
pub(crate) mod maintenance;
pub(crate) mod task;
