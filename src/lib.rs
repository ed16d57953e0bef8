// ABOUTME: Library crate for mongoproxy exposing the proxy core and configuration

#![allow(missing_docs)]

pub mod cli;
pub mod config;
pub mod proxy;
