//! Task-file parser.
//!
//! Extracts [`Task`] records from a markdown task file using three ordered
//! detection strategies: a structured section scan, a global checkbox scan,
//! and a whole-file fallback. The first strategy that yields at least one
//! task wins.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result, bail};
use regex::Regex;
use tracing::debug;

/// A single unit of work parsed from a task file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Task {
    /// Short, single-line title from the item text.
    pub title: String,
    /// Multi-line description; may be empty.
    pub description: String,
    /// Branch- and filename-safe identifier, e.g. "add-user-auth".
    pub slug: String,
    /// Per-task model override; empty when the run default applies.
    pub model: String,
}

impl Task {
    /// Title plus description joined by a blank line, as fed to agents.
    pub fn full_text(&self) -> String {
        if self.description.is_empty() {
            self.title.clone()
        } else {
            format!("{}\n\n{}", self.title, self.description)
        }
    }
}

static MODEL_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[model:([^\]]+)\]").expect("model annotation pattern"));
static TITLE_ANNOTATION: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[title:([^\]]+)\]").expect("title annotation pattern"));
static CHECKBOX_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+\[([ xX])\]\s+(.*)$").expect("checkbox pattern"));
static BULLET_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*[-*]\s+(.*)$").expect("bullet pattern"));
static NUMBERED_ITEM: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^\s*\d+[.)]\s+(.*)$").expect("numbered pattern"));

/// Section headings (case-insensitive) that open tasks mode.
const TASK_HEADINGS: &[&str] = &[
    "tasks",
    "task",
    "todo",
    "to-do",
    "action items",
    "work items",
    "checklist",
    "steps",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ItemKind {
    Checkbox,
    Bullet,
    Numbered,
}

/// An item line being accumulated into a task.
#[derive(Debug)]
struct ItemDraft {
    kind: ItemKind,
    title_text: String,
    description: Vec<String>,
}

/// Parse a task file into an ordered list of tasks.
///
/// Strategy 1 (structured section scan) and strategy 2 (global checkbox scan)
/// finding nothing is not an error as long as a later strategy succeeds; an
/// input that is empty after all three fails.
pub fn parse_file(path: &Path) -> Result<Vec<Task>> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("cannot open task file {}", path.display()))?;

    let tasks = scan_structured(&content);
    if !tasks.is_empty() {
        debug!(count = tasks.len(), "structured section scan matched");
        return Ok(tasks);
    }

    let tasks = scan_checkboxes(&content);
    if !tasks.is_empty() {
        debug!(count = tasks.len(), "global checkbox scan matched");
        return Ok(tasks);
    }

    debug!("falling back to whole-file task");
    Ok(vec![fallback_whole_file(path, &content)?])
}

/// Strategy 1: items under a tasks-mode `## ` heading.
fn scan_structured(content: &str) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut current: Option<ItemDraft> = None;
    let mut in_tasks = false;

    for line in content.lines() {
        let trimmed = line.trim();

        if let Some(heading) = trimmed.strip_prefix("## ") {
            finish_item(&mut tasks, current.take());
            let heading = heading.trim().to_lowercase();
            in_tasks = TASK_HEADINGS.contains(&heading.as_str());
            continue;
        }
        if !in_tasks {
            continue;
        }

        if let Some((kind, checked, text)) = classify_item(line) {
            finish_item(&mut tasks, current.take());
            if checked {
                // Completed checkbox: skipped entirely.
                continue;
            }
            current = Some(ItemDraft {
                kind,
                title_text: text.to_string(),
                description: Vec::new(),
            });
            continue;
        }

        append_description_line(&mut tasks, &mut current, line);
    }

    finish_item(&mut tasks, current.take());
    tasks
}

/// Strategy 2: checkbox items anywhere in the file, ignoring sections.
fn scan_checkboxes(content: &str) -> Vec<Task> {
    let mut tasks = Vec::new();
    let mut current: Option<ItemDraft> = None;

    for line in content.lines() {
        if let Some((ItemKind::Checkbox, checked, text)) = classify_item(line) {
            finish_item(&mut tasks, current.take());
            if checked {
                continue;
            }
            current = Some(ItemDraft {
                kind: ItemKind::Checkbox,
                title_text: text.to_string(),
                description: Vec::new(),
            });
            continue;
        }

        append_description_line(&mut tasks, &mut current, line);
    }

    finish_item(&mut tasks, current.take());
    tasks
}

/// Strategy 3: the whole file as one task titled after the file stem.
fn fallback_whole_file(path: &Path, content: &str) -> Result<Task> {
    if content.trim().is_empty() {
        bail!("task file {} is empty", path.display());
    }

    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "task".to_string());

    let mut body = content.to_string();
    let mut model = String::new();
    if let Some(caps) = MODEL_ANNOTATION.captures(&body) {
        model = caps[1].trim().to_string();
        body = MODEL_ANNOTATION.replace_all(&body, "").trim().to_string();
    }
    let mut title = stem;
    if let Some(caps) = TITLE_ANNOTATION.captures(&body) {
        let explicit = caps[1].trim().to_string();
        body = TITLE_ANNOTATION.replace_all(&body, "").trim().to_string();
        if !explicit.is_empty() {
            title = explicit;
        }
    }

    Ok(Task {
        slug: slugify(&title),
        title,
        description: body.trim().to_string(),
        model,
    })
}

/// Classify one line as an item. Returns the kind, whether a checkbox was
/// already checked, and the item text after the marker.
fn classify_item(line: &str) -> Option<(ItemKind, bool, &str)> {
    if let Some(caps) = CHECKBOX_ITEM.captures(line) {
        let checked = !caps.get(1).is_some_and(|m| m.as_str() == " ");
        let text = caps.get(2).map_or("", |m| m.as_str());
        return Some((ItemKind::Checkbox, checked, text));
    }
    if let Some(caps) = BULLET_ITEM.captures(line) {
        return Some((ItemKind::Bullet, false, caps.get(1).map_or("", |m| m.as_str())));
    }
    if let Some(caps) = NUMBERED_ITEM.captures(line) {
        return Some((ItemKind::Numbered, false, caps.get(1).map_or("", |m| m.as_str())));
    }
    None
}

/// Route a non-item line into the current draft's description.
///
/// Blank lines terminate a checkbox item but are retained in the description
/// of bullet/numbered items.
fn append_description_line(tasks: &mut Vec<Task>, current: &mut Option<ItemDraft>, line: &str) {
    let Some(draft) = current.as_mut() else {
        return;
    };
    if line.trim().is_empty() {
        if draft.kind == ItemKind::Checkbox {
            finish_item(tasks, current.take());
        } else {
            draft.description.push(line.to_string());
        }
        return;
    }
    draft.description.push(line.to_string());
}

/// Extract annotations, derive the slug, and push the finished task.
///
/// Items whose title is empty after annotation stripping are dropped.
fn finish_item(tasks: &mut Vec<Task>, draft: Option<ItemDraft>) {
    let Some(draft) = draft else {
        return;
    };

    let mut title = draft.title_text.trim().to_string();
    let mut model = String::new();

    if let Some(caps) = MODEL_ANNOTATION.captures(&title) {
        model = caps[1].trim().to_string();
        title = MODEL_ANNOTATION.replace_all(&title, "").trim().to_string();
    }
    if let Some(caps) = TITLE_ANNOTATION.captures(&title) {
        let explicit = caps[1].trim().to_string();
        title = TITLE_ANNOTATION.replace_all(&title, "").trim().to_string();
        if !explicit.is_empty() {
            title = explicit;
        }
    }
    let slug = slugify(&title);
    if title.is_empty() || slug.is_empty() {
        return;
    }

    tasks.push(Task {
        slug,
        title,
        description: draft.description.join("\n").trim().to_string(),
        model,
    });
}

/// Convert a human-readable string into a lowercase, hyphen-separated
/// identifier. e.g. "Add user auth!" -> "add-user-auth".
///
/// Each maximal run of non-alphanumeric characters collapses to a single
/// dash; the result is trimmed of dashes and capped at 100 characters.
pub fn slugify(s: &str) -> String {
    let mut out = String::new();
    let mut prev_dash = false;
    for c in s.to_lowercase().chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c);
            prev_dash = false;
        } else if !prev_dash && !out.is_empty() {
            out.push('-');
            prev_dash = true;
        }
    }

    let mut out = out.trim_end_matches('-').to_string();
    if out.len() > 100 {
        out.truncate(100);
        out = out.trim_end_matches('-').to_string();
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn parse_str(content: &str, name: &str) -> Vec<Task> {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join(name);
        fs::write(&path, content).expect("write task file");
        parse_file(&path).expect("parse")
    }

    #[test]
    fn structured_scan_extracts_annotated_tasks() {
        let tasks = parse_str(
            "# Plan\n## Tasks\n- Add auth [model:claude-opus-4-6]\n- Fix navbar [title:navbar]\n",
            "plan.md",
        );

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].title, "Add auth");
        assert_eq!(tasks[0].slug, "add-auth");
        assert_eq!(tasks[0].model, "claude-opus-4-6");
        assert_eq!(tasks[1].title, "navbar");
        assert_eq!(tasks[1].slug, "navbar");
        assert_eq!(tasks[1].model, "");
    }

    #[test]
    fn structured_scan_accepts_alternate_headings_and_numbered_items() {
        let tasks = parse_str(
            "## Action Items\n1. First thing\n2) Second thing\n\n## Notes\n- not a task\n",
            "plan.md",
        );

        let slugs: Vec<&str> = tasks.iter().map(|t| t.slug.as_str()).collect();
        assert_eq!(slugs, vec!["first-thing", "second-thing"]);
    }

    #[test]
    fn structured_scan_collects_descriptions() {
        let tasks = parse_str(
            "## Tasks\n- Add auth\n  Use the session middleware.\n\n  Cover logout too.\n- Fix navbar\n",
            "plan.md",
        );

        assert_eq!(tasks.len(), 2);
        assert_eq!(
            tasks[0].description,
            "Use the session middleware.\n\n  Cover logout too."
        );
        assert_eq!(tasks[1].description, "");
    }

    #[test]
    fn structured_scan_skips_checked_boxes() {
        let tasks = parse_str(
            "## Todo\n- [ ] A\n  detail for A\n- [x] B\n- [ ] C\n",
            "plan.md",
        );

        let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "C"]);
        assert_eq!(tasks[0].description, "detail for A");
    }

    #[test]
    fn blank_line_terminates_checkbox_description() {
        let tasks = parse_str(
            "## Tasks\n- [ ] A\n  first\n\n  stray prose\n",
            "plan.md",
        );

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].description, "first");
    }

    #[test]
    fn global_checkbox_scan_applies_without_task_section() {
        let tasks = parse_str("# Notes\n\n- [ ] A\n- [x] B\n- [ ] C\n", "notes.md");

        let titles: Vec<&str> = tasks.iter().map(|t| t.title.as_str()).collect();
        assert_eq!(titles, vec!["A", "C"]);
    }

    #[test]
    fn plain_bullets_outside_a_task_section_do_not_match() {
        // No tasks heading and no checkboxes: the file collapses to one task.
        let tasks = parse_str("# Doc\n- just a list\n- of notes\n", "doc.md");

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "doc");
    }

    #[test]
    fn fallback_uses_file_stem_and_strips_annotations() {
        let tasks = parse_str("hello [model:gemini-2.5-pro]", "architecture.md");

        assert_eq!(tasks.len(), 1);
        assert_eq!(tasks[0].title, "architecture");
        assert_eq!(tasks[0].description, "hello");
        assert_eq!(tasks[0].slug, "architecture");
        assert_eq!(tasks[0].model, "gemini-2.5-pro");
    }

    #[test]
    fn empty_input_is_an_error() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("empty.md");
        fs::write(&path, "   \n\n").expect("write");

        let err = parse_file(&path).unwrap_err();
        assert!(err.to_string().contains("is empty"));
    }

    #[test]
    fn missing_file_is_an_open_error() {
        let err = parse_file(Path::new("/nonexistent/tasks.md")).unwrap_err();
        assert!(err.to_string().contains("cannot open task file"));
    }

    #[test]
    fn slugify_basics() {
        assert_eq!(slugify("Add user auth!"), "add-user-auth");
        assert_eq!(slugify("  --Fix:: the NAVBAR--  "), "fix-the-navbar");
        assert_eq!(slugify("héllo wörld"), "h-llo-w-rld");
        assert_eq!(slugify("___"), "");
    }

    #[test]
    fn slugify_caps_length_at_100() {
        let long = "word ".repeat(50);
        let slug = slugify(&long);
        assert!(slug.len() <= 100);
        assert!(!slug.ends_with('-'));
    }

    #[test]
    fn slugs_are_always_branch_safe() {
        let tasks = parse_str(
            "## Tasks\n- Fix (all) the things!!\n- 100% coverage, please\n- émigré support\n",
            "plan.md",
        );

        let re = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").expect("slug pattern");
        for task in &tasks {
            assert!(re.is_match(&task.slug), "bad slug {:?}", task.slug);
            assert!(task.slug.len() <= 100);
        }
    }

    #[test]
    fn reparsing_serialized_tasks_is_a_fixed_point() {
        let tasks = parse_str(
            "## Tasks\n- Add auth [model:claude-opus-4-6]\n- Fix navbar [title:navbar]\n- [ ] Write docs\n",
            "plan.md",
        );

        let mut serialized = String::from("## Tasks\n");
        for task in &tasks {
            serialized.push_str(&format!("- {}\n", task.title));
        }
        let reparsed = parse_str(&serialized, "plan.md");

        assert_eq!(reparsed.len(), tasks.len());
        for (a, b) in tasks.iter().zip(&reparsed) {
            assert_eq!(a.title, b.title);
            assert_eq!(a.slug, b.slug);
        }
    }

    #[test]
    fn full_text_joins_title_and_description() {
        let task = Task {
            title: "Add auth".to_string(),
            description: "Use sessions.".to_string(),
            slug: "add-auth".to_string(),
            model: String::new(),
        };
        assert_eq!(task.full_text(), "Add auth\n\nUse sessions.");

        let bare = Task {
            description: String::new(),
            ..task
        };
        assert_eq!(bare.full_text(), "Add auth");
    }
}
