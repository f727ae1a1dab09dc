#[path = "../core/node.rs"]
pub mod node;

#[path = "../core/filter.rs"]
pub mod filter;

#[path = "../core/tags.rs"]
pub mod tags;

#[path = "../core/config.rs"]
pub mod config;

#[path = "../core/extract.rs"]
pub mod extract;

#[path = "../core/migrate.rs"]
pub mod migrate;

#[path = "../core/emit.rs"]
pub mod emit;

#[path = "../core/loader.rs"]
pub mod loader;

#[path = "../core/links.rs"]
pub mod links;

#[path = "../core/fetch.rs"]
pub mod fetch;

#[path = "../core/generate.rs"]
pub mod generate;
