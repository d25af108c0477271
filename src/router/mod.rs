mod router;

pub use router::MessageRouter;
pub use router::RouterHandle;
