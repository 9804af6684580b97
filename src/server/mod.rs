// Local HTTP surface for the player.

pub mod handler;
