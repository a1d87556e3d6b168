// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod agent_loop;
mod compact;
mod context;
mod controller;
mod events;
mod lanes;
mod prompts;
mod prune;
mod steer;
mod stream;
#[cfg(test)]
mod tests;

pub use agent_loop::{run_loop, LoopParams, LoopResult, SKIPPED_RESULT_CONTENT};
pub use compact::{needs_compaction, prepare_compaction, Compaction};
pub use context::{
    load_bootstrap, truncate_head_tail, BOOTSTRAP_FILES, SUBAGENT_BOOTSTRAP_FILES,
};
pub use controller::{Agent, RunOutcome};
pub use events::AgentEvent;
pub use lanes::{session_lane, LaneOpts, LaneScheduler, GLOBAL_LANE};
pub use prompts::{skills_block, system_prompt, PromptInputs, DEFAULT_SYSTEM_PROMPT};
pub use prune::{prune, PruneOutcome, CLEARED_PLACEHOLDER};
pub use steer::SteeringQueue;
pub use stream::{EventSink, EventStream, ResultHandle};
