pub mod catalog_cache;
pub mod pricing_service;
pub mod reconcile;
pub mod store;
pub mod sync_service;

#[cfg(test)]
pub(crate) mod fakes;
