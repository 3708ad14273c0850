// src/lib.rs

pub mod api;
pub mod auth;
pub mod config;
pub mod database;
pub mod error;
pub mod hub;
pub mod models;
pub mod state;
pub mod websocket;
