//! Container lifecycle management for berth test harnesses.
//!
//! A [`ContainerDefinition`](definition::ContainerDefinition) is built once,
//! turned into a [`ContainerHandle`](container::ContainerHandle), started
//! through a [`ContainerRuntime`](backend::ContainerRuntime), and waited on
//! with its [`WaitStrategy`](wait::WaitStrategy) before scenario code runs.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod backend;
pub mod container;
pub mod definition;
pub mod logs;
pub mod ports;
pub mod wait;
