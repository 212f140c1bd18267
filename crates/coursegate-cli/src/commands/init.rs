//! The `coursegate init` command.

use anyhow::Result;

pub fn execute() -> Result<()> {
    if std::path::Path::new("coursegate.toml").exists() {
        println!("coursegate.toml already exists, skipping.");
    } else {
        std::fs::write("coursegate.toml", SAMPLE_CONFIG)?;
        println!("Created coursegate.toml");
    }

    std::fs::create_dir_all("courses")?;
    let example_path = std::path::Path::new("courses/example.toml");
    if example_path.exists() {
        println!("courses/example.toml already exists, skipping.");
    } else {
        std::fs::write(example_path, EXAMPLE_COURSE)?;
        println!("Created courses/example.toml");
    }

    println!("\nNext steps:");
    println!("  1. Run: coursegate validate --course courses/example.toml");
    println!("  2. Run: coursegate attempt --course courses/example.toml --as sam start --test t-safety");
    println!("  3. Run: coursegate leaderboard --test t-safety");

    Ok(())
}

const SAMPLE_CONFIG: &str = r#"# coursegate configuration

# Hide every resource of a level while its test is in progress.
lock_resources_during_test = false

# Trim whitespace from single answers before comparing.
trim_answers = true

# Cache group-gating lookups per principal.
cache_access = true

event_capacity = 64

# Used by tests that don't define their own grades.
default_grade_table = [
    { label = "Fail" },
    { threshold = 50, label = "Pass" },
]
"#;

const EXAMPLE_COURSE: &str = r#"[course]
name = "Example course"
description = "A single safety level with a short test"

[[groups]]
id = "staff"
name = "Staff"

[[principals]]
id = "admin"
name = "Administrator"
role = "administrator"

[[principals]]
id = "sam"
name = "Sam Trainee"
role = "trainee"
groups = ["staff"]

[[levels]]
id = "safety"
name = "Site safety"
groups = ["staff"]

[[resources]]
id = "safety-notes"
level = "safety"
name = "Safety notes"

[[tests]]
id = "t-safety"
level = "safety"
name = "Safety test"
resit_attempts = 2
time_limit = "00:20:00"

[[questions]]
id = "s1"
test = "t-safety"
type = "multiple"
prompt = "Where is the nearest fire exit marked?"
options = ["on the floor plan", "nowhere"]
correct = 0

[[questions]]
id = "s2"
test = "t-safety"
type = "single"
prompt = "Number to call in an emergency?"
expected = "999"
"#;
