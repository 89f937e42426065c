pub mod client;

pub use client::SpotifyApiClient;
