/// Plain data carried between the store, the engine pieces and the services.

pub mod definition;
pub mod ids;
pub mod job;
pub mod module;
pub mod world;
