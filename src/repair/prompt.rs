//! Repair prompts.

use crate::outcome::Diff;

const FIRST_ATTEMPT: &str = "\
Create a patch to fix the {bug_class} bug described below and apply it to the code.
NEVER modify files outside the source directory.
NEVER run git operations in or outside the source directory.
";

const RETRY: &str = "\
I tried to fix a {bug_class} vulnerability causing the crash log below.
These patches failed to fix it:

{failed_patches}
Explain why the patches failed and provide a new patch that fixes the vulnerability.
Do not repeat the same mistakes. Try a completely different approach.
NEVER modify files outside the source directory.
NEVER run git operations in or outside the source directory.
";

/// Failed diffs accumulated across attempts, oldest first.
#[derive(Debug, Clone, Default)]
pub struct Feedback {
    patches: Vec<String>,
    max_chars: Option<usize>,
}

impl Feedback {
    /// `max_chars` caps the rendered transcript; older patches are dropped
    /// first once it is exceeded.
    pub fn new(max_chars: Option<usize>) -> Self {
        Self {
            patches: Vec::new(),
            max_chars,
        }
    }

    pub fn push(&mut self, diff: &Diff) {
        self.patches.push(diff.to_text());
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    pub fn len(&self) -> usize {
        self.patches.len()
    }

    fn block(patch: &str) -> String {
        format!("```diff\n{}\n```\n\n", patch.trim_end_matches('\n'))
    }

    /// Every failed patch as a fenced block, in attempt order.
    pub fn render(&self) -> String {
        let blocks: Vec<String> = self.patches.iter().map(|p| Self::block(p)).collect();
        let Some(limit) = self.max_chars else {
            return blocks.concat();
        };

        let mut kept = 0;
        let mut used = 0;
        for block in blocks.iter().rev() {
            let len = block.chars().count();
            if kept > 0 && used + len > limit {
                break;
            }
            used += len;
            kept += 1;
        }
        let omitted = blocks.len() - kept;
        let mut out = String::new();
        if omitted > 0 {
            out.push_str(&format!(
                "({} earlier failed patch{} omitted)\n\n",
                omitted,
                if omitted == 1 { "" } else { "es" }
            ));
        }
        out.push_str(&blocks[omitted..].concat());
        out
    }
}

/// Build the prompt for the next attempt.
pub fn render_prompt(
    bug_class: Option<&str>,
    crash_log: Option<&str>,
    feedback: &Feedback,
) -> String {
    let bug_class = bug_class.filter(|c| !c.trim().is_empty()).unwrap_or("security");
    let mut prompt = if feedback.is_empty() {
        FIRST_ATTEMPT.replace("{bug_class}", bug_class)
    } else {
        RETRY
            .replace("{bug_class}", bug_class)
            .replace("{failed_patches}", &feedback.render())
    };
    if let Some(log) = crash_log.filter(|l| !l.trim().is_empty()) {
        prompt.push_str("\nBelow is the crash log:\n\n<crash_log>\n");
        prompt.push_str(log.trim_end());
        prompt.push_str("\n</crash_log>\n");
    }
    prompt
}
