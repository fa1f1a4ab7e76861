pub mod catalog;
pub mod promo;
pub mod subscription;
pub mod user;
