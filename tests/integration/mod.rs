//! Integration tests for the meshstore replicated-store engine

mod config_layers;
mod merge_engine;
mod reachability;
mod slot_resolution;
mod store_crdt;
