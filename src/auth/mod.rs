mod gate;

pub use gate::{AllowAll, AuthorizationGate, ConfigGate, Metadata, PredicateGate};
