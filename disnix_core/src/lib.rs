#![allow(non_snake_case)]

#[macro_use]
extern crate log;

#[macro_use]
extern crate error_chain;

error_chain! {
    types {
        Error, ErrorKind, ResultExt, Result;
    }
    links {
        Defs(disnix_definitions::Error, disnix_definitions::ErrorKind);
    }
    foreign_links {
        Io(::std::io::Error);
    }
    errors {
        SubprocessError(verb: String, target: String, detail: String) {
            description("a client-interface subprocess exited unsuccessfully")
            display("'{}' against target '{}' failed: {}", verb, target, detail)
        }
        SchedulerError(msg: String) {
            description("the transition engine reached an inconsistent state")
            display("scheduler error: {}", msg)
        }
        StateUnknown(msg: String) {
            description("an interrupted or crashed run leaves an activation mapping's status unknown")
            display("state unknown: {}", msg)
        }
        LockError(msg: String) {
            description("the distributed locking phase failed")
            display("lock error: {}", msg)
        }
    }
}

/// Cooperative SIGINT handling: the single `Arc<AtomicBool>` every long-running
/// loop in this crate polls at its head (§5, §9 design note).
pub mod signal;

/// The generic bounded subprocess iterator (C4): fans work out across a
/// concurrency limit and folds results back in completion order.
pub mod process;

/// Invokes the target's client-interface command for a single verb (§6).
pub mod client;

/// The dependency-ordered scheduler (C5): the ACTIVATED/DEACTIVATED
/// state machine that drives one union array to its terminal state.
pub mod scheduler;

/// The transition engine (C6): two-phase deactivate/activate with rollback.
pub mod transition;

/// The state-migration engine (C7): snapshot export/transfer/import ordering.
pub mod migration;

/// The distributed locking phase (C8).
pub mod lock;

/// Profile commit (C9): target profiles and the coordinator profile.
pub mod profile;

/// Closure transfer helpers (C11): copy_closure_to/copy_closure_from.
pub mod closure;

/// The pipeline driver (C10): wires C1-C9+C11 into activate_system.
pub mod pipeline;

pub use pipeline::{activate_system, ActivationOptions, ActivationReport};
pub use signal::Interrupt;
