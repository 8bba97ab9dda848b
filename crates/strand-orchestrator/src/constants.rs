//! Reserved channel names and the router's ownership group.

use strand_contract::{ChannelSpec, StateSchema};

/// Ownership group of the coordinator itself. Worker groups may not use it.
pub const ROUTER_GROUP: &str = "router";

/// Current stage name (overwrite).
pub const STAGE_CHANNEL: &str = "stage";

/// The recorded routing decision for the step in flight (overwrite).
pub const ROUTE_CHANNEL: &str = "route";

/// External inputs, appended in arrival order.
pub const EVENTS_CHANNEL: &str = "events";

/// Human-readable failure record `{worker, reason}` (overwrite).
pub const FAILURE_CHANNEL: &str = "failure";

/// Reason the router fell back to the clarification stage (overwrite).
pub const CLARIFICATION_CHANNEL: &str = "clarification";

/// Decisions taken on suspended checkpoints, appended in order.
pub const DECISIONS_CHANNEL: &str = "decisions";

/// Add the router-owned channels to a schema. Called by the orchestrator
/// builder; user schemas declare only worker channels.
pub fn install_router_channels(schema: StateSchema) -> StateSchema {
    schema
        .with_channel(ChannelSpec::overwrite(STAGE_CHANNEL, ROUTER_GROUP))
        .with_channel(ChannelSpec::overwrite(ROUTE_CHANNEL, ROUTER_GROUP))
        .with_channel(ChannelSpec::append(EVENTS_CHANNEL, ROUTER_GROUP))
        .with_channel(ChannelSpec::overwrite(FAILURE_CHANNEL, ROUTER_GROUP))
        .with_channel(ChannelSpec::overwrite(CLARIFICATION_CHANNEL, ROUTER_GROUP))
        .with_channel(ChannelSpec::append(DECISIONS_CHANNEL, ROUTER_GROUP))
}
