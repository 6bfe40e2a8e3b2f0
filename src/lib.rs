#![forbid(unsafe_code)]

pub mod app;
pub mod cli;
pub mod collaborators;
pub mod commands;
pub mod config;
pub mod db;
pub mod export;
pub mod generator;
pub mod library;
pub mod llm;
pub mod logging;
pub mod markdown;
pub mod progress;
