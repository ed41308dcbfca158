// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod builtin;
pub mod permission;
pub mod policy;
pub mod registry;
pub mod tool;

pub use permission::{tool_pattern, tool_permission_name, DoomLoopWindow, PermissionEngine, PermissionRule};
pub use policy::ApprovalPolicy;
pub use registry::{ToolRegistry, ToolSchema};
pub use tool::{OutputCategory, Tool, ToolCall, ToolContext, ToolOutput, ToolOutputPart};

pub use builtin::ask_question::{AskQuestionTool, Question, QuestionRequest};
pub use builtin::edit_file::EditFileTool;
pub use builtin::read_file::ReadFileTool;
pub use builtin::shell::ShellTool;
pub use builtin::write::WriteTool;
