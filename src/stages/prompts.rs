//! Prompt templates for the worker CLI.
//!
//! Each builder interpolates the user task (verbatim) and whatever
//! upstream artifacts the stage needs, and spells out the exact JSON
//! object the worker must end its output with. The worker is told never
//! to run git itself — the orchestrator owns version control.

pub fn analyze_prompt(user_task: &str) -> String {
    format!(
        r#"You are preparing a repository for parallel automated editing.

User task:
{user_task}

Decide whether a small preparatory refactor would make this task easier to
split into independent, parallel subtasks (e.g. splitting an oversized
module that several subtasks would otherwise contend on).

This step is READ-ONLY. Do not modify any files. Do not run git.

End your output with a JSON object of this exact shape:
{{
  "shouldRefactor": true or false,
  "reasons": ["why or why not"],
  "focusAreas": [
    {{"path": "relative/file", "why": "what makes it a bottleneck", "suggestedSplit": "optional suggestion"}}
  ],
  "notes": "optional free text"
}}"#
    )
}

pub fn refactor_prompt(user_task: &str, analysis_notes: &str) -> String {
    format!(
        r#"You are performing a minimal preparatory refactor so that the
following user task can be split into parallel subtasks.

User task:
{user_task}

Analysis from the previous step:
{analysis_notes}

Rules:
- Keep the refactor minimal and strictly behaviour-preserving.
- Only restructure; do not start implementing the user task.
- Do NOT run any git commands. The orchestrator commits for you.

End your output with a JSON object of this exact shape:
{{
  "status": "ok" | "skipped" | "failed",
  "summary": "what you changed",
  "touchedFiles": ["relative/paths"],
  "notes": "optional free text"
}}"#
    )
}

pub fn plan_prompt(user_task: &str) -> String {
    format!(
        r#"Produce a deterministic implementation plan for the user task below,
as a sequence of subtasks that an automated editor will execute.

User task:
{user_task}

This step is READ-ONLY. Do not modify any files. Do not run git.

Rules:
- Give every subtask a stable string id (short, kebab-case).
- Subtasks that can safely run at the same time share a "parallelGroup"
  label; order groups by when they must run.
- Set "canParallelize" to false if the subtasks must run strictly in
  sequence.
- Keep the plan small; do not over-decompose simple tasks.

End your output with a JSON object of this exact shape:
{{
  "canParallelize": true or false,
  "subtasks": [
    {{
      "id": "stable-id",
      "title": "short title",
      "description": "full instructions for the subtask",
      "parallelGroup": "optional group label",
      "context": "optional extra context",
      "notes": "optional free text"
    }}
  ]
}}"#
    )
}

pub fn subtask_prompt(user_task: &str, subtask_id: &str, title: &str, description: &str) -> String {
    format!(
        r#"You are executing one subtask of a larger plan.

Overall user task (for context, do not do all of it):
{user_task}

Your subtask:
  id: {subtask_id}
  title: {title}
  description: {description}

Rules:
- Modify the files needed for THIS subtask only.
- Do NOT run any git commands. The orchestrator commits for you.

End your output with a JSON object of this exact shape:
{{
  "subtaskId": "{subtask_id}",
  "status": "ok" | "failed",
  "summary": "what you did",
  "importantFiles": ["relative/paths worth reviewing"]
}}"#
    )
}

pub fn conflict_prompt(branch: &str, files: &[String]) -> String {
    let listing = files
        .iter()
        .map(|f| format!("  - {}", f))
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"A git merge of branch {branch} stopped with conflicts. Resolve them.

Conflicted files:
{listing}

Rules:
- Edit ONLY the conflicted files, removing every conflict marker and
  producing the correct combined content.
- Do NOT run any git commands of any kind.
- Do NOT touch the .git or .git-local entries in this directory.

End your output with a JSON object of this exact shape:
{{
  "status": "ok" | "needs_manual_review",
  "notes": "what you resolved and how"
}}"#
    )
}
