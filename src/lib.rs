//! Debug-execution engine for a Target Communication Framework agent: the
//! context model and event dispatch, the software-breakpoint engine, and
//! per-architecture stepping support (register file, break-instruction
//! table, breakpoint registry, replant engine, skip-sequencer, ARM
//! next-PC predictor, hardware-breakpoint multiplexer). RPC framing,
//! channel multiplexing, the JSON wire codec, and symbol/line-number
//! resolution are out of scope here and modeled as collaborator traits
//! (see [`agent::AddressResolver`], [`breakpoint::ConditionEvaluator`],
//! [`context::ContextEventSink`]) that an outer crate wires in.

pub mod agent;
pub mod arch;
pub mod break_table;
pub mod breakpoint;
pub mod config;
pub mod context;
pub mod error;
pub mod hwbp;
pub mod log;
pub mod registers;
pub mod replant;
pub mod safe_event;
pub mod signal_set;
pub mod skip_sequencer;
pub mod step;
pub mod target_io;
pub mod wait_pid;
