pub mod catalog_repo;
pub mod subscription_repo;
pub mod user_repo;
