pub(crate) mod deferred;
pub(crate) mod queue;
pub(crate) mod reactor;
