//! This crate is the composite of the Coordinator, the Load Balancer, and
//! the lower orchestration crates. We provide pluggable selection
//! strategies and multi-model consensus for verified analysis results.

#![deny(warnings)]

pub mod balancer;
pub mod config;
pub mod consensus;
pub mod coordinator;

pub use balancer::{Candidate, LeastLoaded, LoadBalancer, PerformanceWeighted, Selection, Strategy};
pub use config::Config;
pub use consensus::ConsensusResult;
pub use coordinator::{AnalysisHandle, AnalysisReport, AnalysisRequest, Coordinator, SystemStatus};
