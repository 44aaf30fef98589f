mod client;

pub use client::CloudClient;
