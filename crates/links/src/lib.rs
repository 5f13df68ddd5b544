// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

use framelink_core::PluginRegistry;

pub mod dup;
pub mod gate;
pub mod merge;
pub mod null_sink;
pub mod null_source;
pub mod output;
pub mod select;
pub mod sync;

#[cfg(feature = "frame_copy")]
pub mod frame_copy;
#[cfg(feature = "ipc")]
pub mod ipc_in;
#[cfg(feature = "ipc")]
pub mod ipc_out;

#[cfg(test)]
pub mod test_utils;

/// Registers every built-in link kind.
///
/// # Panics
///
/// Panics if config schemas cannot be serialized to JSON (should never happen).
#[allow(clippy::expect_used)] // Schema serialization should never fail for valid types
pub fn register_links(registry: &mut PluginRegistry) {
    use schemars::schema_for;

    // --- Sources and sinks ---
    registry.register(
        "null_source",
        || Box::new(null_source::NullSource::new()),
        serde_json::to_value(schema_for!(null_source::NullSourceConfig))
            .expect("NullSourceConfig schema should serialize to JSON"),
        vec!["source".to_string()],
        "Emits one empty video buffer per channel on every tick or NEW_DATA. \
         Useful for exercising pipelines without capture hardware.",
    );
    registry.register(
        "null_sink",
        || Box::new(null_sink::NullSink::new()),
        serde_json::to_value(schema_for!(null_sink::NullSinkConfig))
            .expect("NullSinkConfig schema should serialize to JSON"),
        vec!["sink".to_string()],
        "Counts and returns every buffer it receives. `hold` keeps buffers back \
         to simulate a slow consumer.",
    );

    // --- Routing ---
    {
        use schemars::JsonSchema;
        use serde::Deserialize;

        #[derive(Deserialize, Debug, Default, JsonSchema)]
        #[serde(default)]
        pub struct MergeConfig {}

        registry.register(
            "merge",
            || Box::new(merge::Merge::new()),
            serde_json::to_value(schema_for!(MergeConfig))
                .expect("MergeConfig schema should serialize to JSON"),
            vec!["routing".to_string()],
            "Combines several input queues into one output queue, renumbering channels \
             consecutively in input order.",
        );
    }
    registry.register(
        "gate",
        || Box::new(gate::Gate::new()),
        serde_json::to_value(schema_for!(gate::GateConfig))
            .expect("GateConfig schema should serialize to JSON"),
        vec!["routing".to_string()],
        "Passes its producer's buffers through while open. Controls: on, off, forward_count.",
    );
    registry.register(
        "dup",
        || Box::new(dup::Dup::new()),
        serde_json::to_value(schema_for!(dup::DupConfig))
            .expect("DupConfig schema should serialize to JSON"),
        vec!["routing".to_string()],
        "Duplicates one input to every output queue by reference; the original is \
         returned once all outputs have released it.",
    );
    registry.register(
        "select",
        || Box::new(select::Select::new()),
        serde_json::to_value(schema_for!(select::SelectConfig))
            .expect("SelectConfig schema should serialize to JSON"),
        vec!["routing".to_string()],
        "Routes input channels to several output queues. Controls: set_out_queue_channels, \
         get_out_queue_channels.",
    );
    registry.register(
        "sync",
        || Box::new(sync::FrameSync::new()),
        serde_json::to_value(schema_for!(sync::SyncConfig))
            .expect("SyncConfig schema should serialize to JSON"),
        vec!["routing".to_string()],
        "Groups one buffer per channel with matching timestamps into a composite buffer \
         and drops buffers that fall out of sync. Control: sync_stats.",
    );

    #[cfg(feature = "frame_copy")]
    registry.register(
        "frame_copy",
        || Box::new(frame_copy::FrameCopy::new()),
        serde_json::to_value(schema_for!(frame_copy::FrameCopyConfig))
            .expect("FrameCopyConfig schema should serialize to JSON"),
        vec!["algorithm".to_string()],
        "Copies each input frame into a buffer from its own pool and returns the \
         input immediately.",
    );

    // --- Cross-context adapters ---
    #[cfg(feature = "ipc")]
    {
        registry.register(
            "ipc_out",
            || Box::new(ipc_out::IpcOut::new()),
            serde_json::to_value(schema_for!(ipc_out::IpcOutConfig))
                .expect("IpcOutConfig schema should serialize to JSON"),
            vec!["ipc".to_string()],
            "Publishes a local producer's buffers to the paired ipc_in through shared slots.",
        );
        registry.register(
            "ipc_in",
            || Box::new(ipc_in::IpcIn::new()),
            serde_json::to_value(schema_for!(ipc_in::IpcInConfig))
                .expect("IpcInConfig schema should serialize to JSON"),
            vec!["ipc".to_string()],
            "Receives buffers from the paired ipc_out and returns their slots when consumed.",
        );
    }

    tracing::info!(kinds = registry.definitions().len(), "Finished registering built-in links.");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_links_exposes_every_kind() {
        let mut registry = PluginRegistry::new();
        register_links(&mut registry);
        for kind in [
            "null_source",
            "null_sink",
            "merge",
            "gate",
            "dup",
            "select",
            "sync",
            "frame_copy",
            "ipc_out",
            "ipc_in",
        ] {
            assert!(registry.contains(kind), "{kind} not registered");
        }
        let definitions = registry.definitions();
        let Some(source) = definitions.iter().find(|d| d.kind == "null_source") else {
            panic!("null_source missing");
        };
        assert!(source.param_schema.get("properties").is_some());
    }
}
