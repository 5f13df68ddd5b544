// SPDX-FileCopyrightText: © 2025 StreamKit Contributors
//
// SPDX-License-Identifier: MPL-2.0

// Allowed: This is a CLI code generation tool, not server code.
// Using println! for progress output is appropriate here.
#![allow(clippy::disallowed_macros)]

use std::fs;
use std::path::Path;
use ts_rs::TS;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let declarations = vec![
        // framelink-core types
        format!("// framelink-core\nexport {}", framelink_core::LinkId::decl()),
        format!("export {}", framelink_core::BufferType::decl()),
        format!("export {}", framelink_core::ChannelInfo::decl()),
        format!("export {}", framelink_core::InQueueParams::decl()),
        format!("export {}", framelink_core::OutQueueParams::decl()),
        format!("export {}", framelink_core::CreateParams::decl()),
        format!("export {}", framelink_core::ControlCommand::decl()),
        format!("export {}", framelink_core::LinkState::decl()),
        format!("export {}", framelink_core::LatencyStats::decl()),
        format!("export {}", framelink_core::stats::ChannelStats::decl()),
        format!("export {}", framelink_core::stats::ExhaustionStats::decl()),
        format!("export {}", framelink_core::stats::PoolSnapshot::decl()),
        format!("export {}", framelink_core::LinkStatsSnapshot::decl()),
        format!("export {}", framelink_core::ControlReply::decl()),
        format!("export {}", framelink_core::PluginDefinition::decl()),
        format!("export {}", framelink_core::ipc::IpcChannelId::decl()),
        format!("export {}", framelink_core::ipc::IpcChannelConfig::decl()),
        // framelink-api types
        format!("\n// framelink-api\nexport {}", framelink_api::GraphLink::decl()),
        format!("export {}", framelink_api::IpcChannelSpec::decl()),
        format!("export {}", framelink_api::LinkGraph::decl()),
        format!("export {}", framelink_api::LinkStatsEntry::decl()),
        format!("export {}", framelink_api::PipelineStats::decl()),
    ];

    let output = declarations.join("\n\n");
    let content = format!(
        "// This file is auto-generated. Do not edit it manually.\n\nexport type JsonValue = unknown;\n\n{output}"
    );

    let manifest_dir = Path::new(env!("CARGO_MANIFEST_DIR"));
    let workspace_root = manifest_dir
        .parent()
        .and_then(|parent| parent.parent())
        .ok_or("Failed to find workspace root from CARGO_MANIFEST_DIR")?;
    let output_dir = workspace_root.join("bindings");
    fs::create_dir_all(&output_dir)?;
    let output_path = output_dir.join("framelink-types.ts");

    println!("Writing TypeScript bindings to: {}", output_path.display());

    fs::write(&output_path, content)?;

    println!("✅ TypeScript bindings generated successfully.");

    Ok(())
}
