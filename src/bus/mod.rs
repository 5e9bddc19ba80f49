pub mod links;
pub mod packet;
