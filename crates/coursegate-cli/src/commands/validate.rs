//! The `coursegate validate` command.

use std::path::PathBuf;

use anyhow::Result;

use coursegate_core::parser;

pub fn execute(course_path: PathBuf) -> Result<()> {
    let courses = if course_path.is_dir() {
        parser::load_course_directory(&course_path)?
    } else {
        vec![parser::parse_course(&course_path)?]
    };

    let mut total_warnings = 0;

    for course in &courses {
        println!(
            "Course: {} ({} levels, {} tests, {} questions)",
            course.name,
            course.levels.len(),
            course.tests.len(),
            course.questions.len()
        );

        let warnings = parser::validate_course(course);
        for w in &warnings {
            let prefix = w
                .entity
                .as_ref()
                .map(|id| format!("  [{id}]"))
                .unwrap_or_else(|| "  ".to_string());
            println!("{prefix} WARNING: {}", w.message);
        }
        total_warnings += warnings.len();
    }

    if total_warnings == 0 {
        println!("All courses valid.");
    } else {
        println!("\n{total_warnings} warning(s) found.");
    }

    Ok(())
}
