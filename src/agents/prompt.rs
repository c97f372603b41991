//! Task prompt rendering.
//!
//! The rendered prompt is the entire interface between the orchestrator and
//! the agent: task body, acceptance criteria, target files, test
//! instructions, and the rules the agent must follow. The orchestrator owns
//! git, so the prompt forbids the agent from committing or pushing.

use crate::api::types::Task;

/// Repository/workspace facts available at prompt time.
#[derive(Debug, Clone, Default)]
pub struct PromptContext {
    pub repo_url: Option<String>,
    pub branch: Option<String>,
    pub cloud_run_url: Option<String>,
    pub working_dir: Option<String>,
}

/// Render the full prompt for a task.
pub fn render(task: &Task, context: &PromptContext) -> String {
    let mut prompt = String::with_capacity(2048);

    prompt.push_str(&format!("# Task: {}\n\n", task.title));
    if let Some(key) = &task.task_key {
        prompt.push_str(&format!("Task key: {key}\n"));
    }
    if let Some(task_type) = &task.task_type {
        prompt.push_str(&format!("Type: {task_type}\n"));
    }
    if let Some(priority) = &task.priority {
        prompt.push_str(&format!("Priority: {priority}\n"));
    }
    prompt.push('\n');

    prompt.push_str("## Description\n\n");
    prompt.push_str(task.body());
    prompt.push_str("\n\n");

    if !task.acceptance_criteria.is_empty() {
        prompt.push_str("## Acceptance criteria\n\n");
        for criterion in &task.acceptance_criteria {
            prompt.push_str(&format!("- {criterion}\n"));
        }
        prompt.push('\n');
    }

    if !task.target_files.is_empty() {
        prompt.push_str("## Target files\n\n");
        prompt.push_str("Focus your changes on these files:\n");
        for file in &task.target_files {
            prompt.push_str(&format!("- {file}\n"));
        }
        prompt.push('\n');
    }

    prompt.push_str("## Repository\n\n");
    if let Some(repo) = &context.repo_url {
        prompt.push_str(&format!("- Remote: {repo}\n"));
    }
    if let Some(branch) = &context.branch {
        prompt.push_str(&format!("- Branch: {branch} (already checked out)\n"));
    }
    if let Some(dir) = &context.working_dir {
        prompt.push_str(&format!("- Working directory: {dir}\n"));
    }
    prompt.push('\n');

    prompt.push_str("## Testing\n\n");
    if let Some(url) = &context.cloud_run_url {
        prompt.push_str(&format!(
            "The application is deployed at {url}. If the project has Playwright \
             configured, add or update E2E tests against that URL; they will be \
             executed with BASE_URL set after you finish.\n\n"
        ));
    } else {
        prompt.push_str(
            "Run the project's unit tests after your changes and make them pass \
             before finishing.\n\n",
        );
    }

    prompt.push_str("## When you are done\n\n");
    prompt.push_str(
        "- Do NOT run `git commit` or `git push`; the orchestrator commits and \
         pushes your changes on the task branch.\n\
         - Do NOT create merge requests or pull requests.\n\
         - Leave the working tree with your final changes in place and exit.\n\
         - Print a short summary of what you changed.\n",
    );

    prompt
}
