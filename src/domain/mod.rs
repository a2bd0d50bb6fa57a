pub mod casts;
pub mod users;
