pub mod checkin;
pub mod contact;
pub mod intent;
pub mod notification;
pub mod settings;
pub mod trip;
pub mod user;
