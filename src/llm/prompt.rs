use sha2::{Digest, Sha256};

use crate::testgen::normalize::CANONICAL_NAME;
use crate::testgen::source::SourceUnit;

const PROMPT_ABI_VERSION: &str = "v1-testgen-multi-backend";

#[derive(Debug, Clone)]
pub struct LlmPrompt {
    pub system: String,
    pub user: String,
}

impl LlmPrompt {
    /// Stable identity of the prompt, recorded with every attempt.
    pub fn hash(&self) -> String {
        let mut h = Sha256::new();
        h.update(PROMPT_ABI_VERSION.as_bytes());
        h.update(self.system.as_bytes());
        h.update(self.user.as_bytes());
        hex::encode(h.finalize())
    }

    /// Single-string form for backends without a system role.
    pub fn flattened(&self) -> String {
        format!("{}\n\n{}", self.system, self.user)
    }
}

pub fn build_prompt(unit: &SourceUnit) -> LlmPrompt {
    LlmPrompt {
        system: system_prompt(),
        user: user_prompt(unit),
    }
}

/* ============================================================
   System prompt (stable, shared by every backend)
   ============================================================ */

fn system_prompt() -> String {
    r#"
You are an expert in Python testing. You write thorough, deterministic pytest suites.

Rules:
- Only output valid Python test code, nothing else
- Every test is a top-level function whose name starts with test_
- Do NOT modify or re-implement the code under test
"#
    .trim()
    .to_string()
}

/* ============================================================
   User prompt (derived from the source file)
   ============================================================ */

fn user_prompt(unit: &SourceUnit) -> String {
    let module = unit.module();
    let mut out = String::new();

    out.push_str("Generate complete pytest tests for the following Python module.\n\n");

    out.push_str("IMPORTANT\n");
    out.push_str(&format!(
        "- Import the module exactly as `{CANONICAL_NAME} = __import__('{module}')`\n"
    ));
    out.push_str(&format!(
        "- Never call functions directly; always go through `{CANONICAL_NAME}.`\n"
    ));
    out.push_str(&format!("- Do not write `import {module}` or `from {module} import ...`\n\n"));

    out.push_str(&format!("FILE: {}\n", unit.file_name()));
    out.push_str("```python\n");
    out.push_str(unit.text());
    if !unit.text().ends_with('\n') {
        out.push('\n');
    }
    out.push_str("```\n\n");

    out.push_str("The tests must:\n");
    out.push_str(&format!("1. Access the module only as `{CANONICAL_NAME}`\n"));
    out.push_str("2. Cover every public function and class\n");
    out.push_str("3. Include edge cases and failure assertions (pytest.raises)\n");
    out.push_str("4. Use pytest\n\n");
    out.push_str("Return only the test code, without explanations.\n");

    out
}
