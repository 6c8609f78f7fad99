//! # Stage Payloads
//!
//! Structured inputs and outputs exchanged with every agent role. These are
//! the declared shapes the [`StageSpec`](super::StageSpec) registry exposes
//! and the invoker validates against.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ============================================================================
// Requirement Analysis
// ============================================================================

/// Heuristic ambiguity signals computed before requirement analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct AmbiguityReport {
    pub is_ambiguous: bool,
    /// Vague qualifiers found ("fast", "user-friendly", ...)
    pub vague_terms_found: usize,
    /// Specification areas never mentioned (I/O, errors, platform, performance)
    pub missing_specifications: usize,
    pub input_length: usize,
}

/// What an earlier run settled on, handed to a follow-up request
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct PriorRun {
    /// Request the earlier run served
    pub request: String,
    #[serde(default)]
    pub functional_requirements: Vec<String>,
    /// Final code of the earlier run, if it got that far
    #[serde(default)]
    pub code: Option<String>,
}

/// Input to the requirement-analysis role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RequirementInput {
    /// The user's natural-language request
    pub request: String,
    pub ambiguity: AmbiguityReport,
    /// Set when this request refines an earlier run; requirements should stay
    /// consistent with it
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<PriorRun>,
}

/// Structured requirements produced by requirement analysis
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Requirements {
    #[serde(default)]
    pub functional_requirements: Vec<String>,
    #[serde(default)]
    pub non_functional_requirements: Vec<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
    #[serde(default)]
    pub clarifying_questions: Vec<String>,
    #[serde(default)]
    pub ambiguity_detected: bool,
    #[serde(default)]
    pub ambiguity_notes: String,
}

// ============================================================================
// Coding + Review
// ============================================================================

/// Severity of a review finding
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Blocking,
    Major,
    Minor,
    Suggestion,
}

/// A single concern raised by the reviewer
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct FeedbackItem {
    pub severity: Severity,
    pub description: String,
}

impl FeedbackItem {
    pub fn new(severity: Severity, description: impl Into<String>) -> Self {
        Self {
            severity,
            description: description.into(),
        }
    }
}

/// Input to the coding role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CodingInput {
    pub requirements: Requirements,
    /// Code of the rejected previous version, if any
    #[serde(default)]
    pub previous_code: Option<String>,
    /// Every feedback item from every rejection so far, oldest first
    #[serde(default)]
    pub feedback: Vec<FeedbackItem>,
    /// Version number the output will receive
    pub attempt: u32,
}

/// Output of the coding role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct CodeDraft {
    pub code: String,
    #[serde(default)]
    pub notes: String,
}

/// Input to the review role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ReviewInput {
    pub requirements: Requirements,
    pub code: String,
    pub code_version: u32,
}

/// Output of the review role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ReviewReport {
    pub approved: bool,
    #[serde(default)]
    pub feedback: Vec<FeedbackItem>,
    #[serde(default)]
    pub summary: String,
}

impl ReviewReport {
    /// Number of blocking concerns
    pub fn blocking_count(&self) -> usize {
        self.feedback
            .iter()
            .filter(|f| f.severity == Severity::Blocking)
            .count()
    }
}

// ============================================================================
// Downstream stages
// ============================================================================

/// Input shared by documentation, test generation and deployment
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DownstreamInput {
    pub requirements: Requirements,
    pub code: String,
    pub code_version: u32,
    /// False when the code is a best-effort artifact the reviewer never approved
    pub approved: bool,
}

/// Output of the documentation role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct Documentation {
    /// Markdown documentation text
    pub content: String,
}

/// Output of the test-generation role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct TestSuite {
    /// Generated test source
    pub code: String,
}

/// A single generated deployment file
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeploymentFile {
    pub path: String,
    pub contents: String,
}

/// Output of the deployment-configuration role
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct DeploymentBundle {
    pub files: Vec<DeploymentFile>,
    #[serde(default)]
    pub setup_instructions: String,
    /// How to put the project under version control and push it to a remote
    #[serde(default)]
    pub vcs_instructions: String,
    #[serde(default)]
    pub hosting_notes: String,
}

const DEFAULT_SETUP: &str = "1. Create a virtual environment: python -m venv venv\n\
2. Activate it: source venv/bin/activate (venv\\Scripts\\activate on Windows)\n\
3. Install dependencies: pip install -r requirements.txt";

const DEFAULT_VCS: &str = "1. Initialize a repository: git init\n\
2. Stage and commit: git add . && git commit -m \"Initial commit\"\n\
3. Create an empty repository on your Git host\n\
4. Add the remote: git remote add origin <repo-url>\n\
5. Push: git push -u origin main";

impl DeploymentBundle {
    /// Fill sections the agent left empty with generic instructions
    pub fn with_fallbacks(mut self) -> Self {
        if self.setup_instructions.trim().is_empty() {
            self.setup_instructions = DEFAULT_SETUP.to_string();
        }
        if self.vcs_instructions.trim().is_empty() {
            self.vcs_instructions = DEFAULT_VCS.to_string();
        }
        self
    }
}
