//! # Stage Registry
//!
//! Declares the fixed stage order and, for every stage, the agent role that
//! serves it, its input/output shapes and whether it belongs to the review
//! loop.
//!
//! ```text
//! requirement-analysis → [coding ⟷ review] → documentation → test-generation → deployment-configuration
//! ```

pub mod parse;
pub mod payloads;

use schemars::{JsonSchema, Schema};
use serde::Serialize;

use crate::agent::AgentRole;
use payloads::{
    CodeDraft, CodingInput, DeploymentBundle, Documentation, DownstreamInput, RequirementInput,
    Requirements, ReviewInput, ReviewReport, TestSuite,
};

pub use parse::{detect_ambiguity, extract_json_object, strip_code_fences};
pub use payloads::{AmbiguityReport, FeedbackItem, PriorRun, Severity};

/// Static description of one pipeline stage
#[derive(Debug, Clone, Copy)]
pub struct StageSpec {
    pub role: AgentRole,
    /// One-line description of what the stage produces
    pub summary: &'static str,
    /// Whether the stage is part of the coding ⟷ review loop
    pub review_loop: bool,
    pub input_schema: fn() -> Schema,
    pub output_schema: fn() -> Schema,
}

fn schema_of<T: JsonSchema>() -> Schema {
    schemars::schema_for!(T)
}

/// Every stage, in execution order
pub static STAGES: [StageSpec; 6] = [
    StageSpec {
        role: AgentRole::RequirementAnalysis,
        summary: "Turn the natural-language request into structured requirements, consistent with the previous run when one is given",
        review_loop: false,
        input_schema: schema_of::<RequirementInput>,
        output_schema: schema_of::<Requirements>,
    },
    StageSpec {
        role: AgentRole::Coding,
        summary: "Generate code for the requirements, addressing all review feedback so far",
        review_loop: true,
        input_schema: schema_of::<CodingInput>,
        output_schema: schema_of::<CodeDraft>,
    },
    StageSpec {
        role: AgentRole::Review,
        summary: "Approve or reject a code version with itemised feedback",
        review_loop: true,
        input_schema: schema_of::<ReviewInput>,
        output_schema: schema_of::<ReviewReport>,
    },
    StageSpec {
        role: AgentRole::Documentation,
        summary: "Write Markdown documentation for the final code",
        review_loop: false,
        input_schema: schema_of::<DownstreamInput>,
        output_schema: schema_of::<Documentation>,
    },
    StageSpec {
        role: AgentRole::TestGeneration,
        summary: "Generate test cases for the final code",
        review_loop: false,
        input_schema: schema_of::<DownstreamInput>,
        output_schema: schema_of::<TestSuite>,
    },
    StageSpec {
        role: AgentRole::DeploymentConfiguration,
        summary: "Produce the deployment file set, setup and version-control instructions",
        review_loop: false,
        input_schema: schema_of::<DownstreamInput>,
        output_schema: schema_of::<DeploymentBundle>,
    },
];

/// Look up the spec for a role
pub fn spec(role: AgentRole) -> &'static StageSpec {
    // STAGES is declared in AgentRole::ALL order
    &STAGES[role as usize]
}

/// Serializable view of a stage spec, schemas included
#[derive(Debug, Clone, Serialize)]
pub struct StageDescription {
    pub role: AgentRole,
    pub summary: &'static str,
    pub review_loop: bool,
    pub input_schema: Schema,
    pub output_schema: Schema,
}

impl StageSpec {
    pub fn describe(&self) -> StageDescription {
        StageDescription {
            role: self.role,
            summary: self.summary,
            review_loop: self.review_loop,
            input_schema: (self.input_schema)(),
            output_schema: (self.output_schema)(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_registry_order_matches_roles() {
        let roles: Vec<AgentRole> = STAGES.iter().map(|s| s.role).collect();
        assert_eq!(roles, AgentRole::ALL.to_vec());
        for role in AgentRole::ALL {
            assert_eq!(spec(role).role, role);
        }
    }

    #[test]
    fn test_only_coding_and_review_loop() {
        let looped: Vec<AgentRole> = STAGES
            .iter()
            .filter(|s| s.review_loop)
            .map(|s| s.role)
            .collect();
        assert_eq!(looped, vec![AgentRole::Coding, AgentRole::Review]);
    }

    #[test]
    fn test_review_output_schema_names_verdict() {
        let schema = serde_json::to_value((spec(AgentRole::Review).output_schema)()).unwrap();
        assert!(schema["properties"].get("approved").is_some());
        let required = schema["required"].as_array().unwrap();
        assert!(required.iter().any(|r| r == "approved"));
    }
}
