// ============================================================================
// Strict linting - Dangerous or non-idiomatic practices are forbidden
// ============================================================================

#![deny(warnings)]                    // All warnings are treated as errors
#![deny(unsafe_code)]                 // Unsafe code is forbidden
#![deny(missing_docs)]                // All public items must be documented
#![deny(dead_code)]                   // Unused code is forbidden
#![deny(non_camel_case_types)]        // Types must follow CamelCase convention

// Additional strictness - Leave nothing unchecked
#![deny(unused_imports)]              // Unused imports are forbidden
#![deny(unused_variables)]            // Unused variables are forbidden
#![deny(unused_must_use)]             // Must handle Result and Option explicitly
#![deny(non_snake_case)]              // Variables and functions must be snake_case
#![deny(non_upper_case_globals)]      // Constants must be UPPER_CASE
#![deny(nonstandard_style)]           // Non-standard code style is forbidden
#![forbid(unsafe_op_in_unsafe_fn)]    // Unsafe ops in unsafe fns are forbidden

// Clippy lints (warnings only)
#![warn(clippy::all)]                 // All standard Clippy lints
#![warn(clippy::pedantic)]            // Very strict Clippy lints
#![warn(clippy::nursery)]             // Experimental lints
#![warn(clippy::unwrap_used)]         // unwrap() warning
#![warn(clippy::expect_used)]         // expect() warning
#![warn(clippy::panic)]               // panic!() warning
#![warn(clippy::print_stdout)]        // println!() warning
#![warn(clippy::todo)]                // TODO warning
#![warn(clippy::unimplemented)]       // unimplemented!() warning
#![warn(clippy::missing_const_for_fn)] // Force const when possible
#![warn(clippy::unwrap_in_result)]    // unwrap() in Result warning
#![warn(clippy::module_inception)]    // Module with same name as crate warning
#![warn(clippy::redundant_clone)]     // Useless clones warning
#![warn(clippy::shadow_unrelated)]    // Shadowing unrelated variables warning
#![warn(clippy::too_many_arguments)]  // Limit function arguments
#![warn(clippy::cognitive_complexity)] // Limit cognitive complexity

// Safety and robustness lints
#![deny(overflowing_literals)]        // Overflowing literals are forbidden
#![deny(arithmetic_overflow)]         // Arithmetic overflow is forbidden

// ============================================================================
// Crate Documentation
// ============================================================================

//! # Stackweave
//!
//! A dependency-ordered deploy and destroy orchestrator for `CloudFormation`
//! stack graphs.
//!
//! ## Overview
//!
//! Stackweave takes a set of synthesized templates with declared
//! dependencies between them and drives every stack to its desired state:
//!
//! - Deploy stacks in dependency order, in parallel where the graph allows
//! - Skip stacks whose deployed template, tags and parameters already match
//! - Remove stacks in reverse dependency order
//! - Stream resource events as they happen, with the first failure reason
//!   captured per stack
//! - Record the outcome of every run
//!
//! ## Architecture
//!
//! A run is a sequence of **passes**. Each pass refreshes the stacks whose
//! operation is still in flight, then dispatches every stack whose
//! dependencies have settled, round after round, until nothing else can
//! start. Failures stay local to the failed stack and what depends on it.
//!
//! ## Modules
//!
//! - [`config`]: Manifest parsing, validation and hashing
//! - [`cloud`]: Control-plane client, retry and template staging
//! - [`deploy`]: Single-stack deployment, skip analysis and event monitoring
//! - [`scheduler`]: Graph ordering and the deploy and destroy loops
//! - [`state`]: Run record and run lock
//! - [`cli`]: Command-line interface
//!
//! ## Example
//!
//! ```yaml
//! project:
//!   name: shop
//!   stage: prod
//!
//! stacks:
//!   - name: network
//!     template: cdk.out/network.template.json
//!   - name: api
//!     template: cdk.out/api.template.json
//!     depends_on: [network]
//! ```

// ============================================================================
// Modules
// ============================================================================

pub mod cli;
pub mod cloud;
pub mod config;
pub mod deploy;
pub mod error;
pub mod scheduler;
pub mod state;

// ============================================================================
// Re-exports
// ============================================================================

pub use cli::{Cli, Commands, OutputFormatter};
pub use cloud::{CloudFormationClient, ControlPlaneClient, RetryPolicy, S3AssetPublisher};
pub use config::{ConfigHasher, ConfigParser, ConfigValidator, DeployConfig};
pub use deploy::{ChangeSetDeployer, SkipDeployAnalyzer, StackEventMonitor, StackSpec, StackTemplate};
pub use error::{Result, StackweaveError};
pub use scheduler::{DeployScheduler, DestroyScheduler, RunReport, StackGraph};
pub use state::{DeploymentState, LocalStateStore, StateStore};
