pub mod client;
pub mod model;

pub use client::RegistryClient;
pub use model::{
    AccessPolicy, ChangeEvent, EventKind, FilterSpec, HeaderPredicate, PolicySource,
    RateLimitRule, RouteDefinition, RoutePredicates,
};
