//! Name codec: slugs, unique stored filenames and category tokens.
//!
//! Slugs are lossy. `unslugify` only approximates the human name and is
//! meant for recovery paths where the catalog no longer has the original.

use super::schema::Category;
use regex::Regex;
use std::sync::LazyLock;
use uuid::Uuid;

/// Number of hex characters appended to generated filenames.
pub const SUFFIX_LEN: usize = 12;

static SUFFIXED_NAME: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?P<base>.+)_(?P<suffix>[0-9a-f]{12})(?P<ext>\.[^.]+)?$")
        .unwrap_or_else(|e| unreachable!("static pattern: {e}"))
});

/// Lowercase, hyphen-separated token. Runs of non-alphanumeric characters
/// collapse into one hyphen; leading and trailing hyphens are dropped.
pub fn slugify(name: &str) -> String {
    let mut slug = String::with_capacity(name.len());
    let mut pending_hyphen = false;
    for c in name.chars() {
        if c.is_alphanumeric() {
            if pending_hyphen && !slug.is_empty() {
                slug.push('-');
            }
            pending_hyphen = false;
            slug.extend(c.to_lowercase());
        } else {
            pending_hyphen = true;
        }
    }
    slug
}

/// Best-effort reverse of [`slugify`]: `calculus-ii` becomes `Calculus Ii`.
pub fn unslugify(slug: &str) -> String {
    slug.split(['-', '_'])
        .filter(|word| !word.is_empty())
        .map(|word| {
            let mut chars = word.chars();
            match chars.next() {
                Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
                None => String::new(),
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// `{slug(base)}_{suffix}.{ext}` with a random suffix.
pub fn generate_unique_filename(base: &str, ext: &str) -> String {
    let mut slug = slugify(base);
    if slug.is_empty() {
        slug.push_str("file");
    }
    let suffix = Uuid::new_v4().simple().to_string();
    let suffix = &suffix[..SUFFIX_LEN];
    let ext = ext.trim_start_matches('.').to_lowercase();
    if ext.is_empty() {
        format!("{slug}_{suffix}")
    } else {
        format!("{slug}_{suffix}.{ext}")
    }
}

/// Strips the `_{suffix}` added by [`generate_unique_filename`]. Names without
/// a recognisable suffix are returned unchanged.
pub fn extract_original_filename(stored: &str) -> String {
    match SUFFIXED_NAME.captures(stored) {
        Some(caps) => {
            let base = caps.name("base").map_or("", |m| m.as_str());
            let ext = caps.name("ext").map_or("", |m| m.as_str());
            format!("{base}{ext}")
        }
        None => stored.to_string(),
    }
}

/// Category for a directory token, if the token is one we know.
pub fn known_category_slug(token: &str) -> Option<Category> {
    let normalized = token.trim().to_lowercase().replace([' ', '_'], "-");
    let category = match normalized.as_str() {
        "lecture-notes" | "notes" | "lectures" | "lecture" => Category::LectureNotes,
        "exams" | "exam" | "past-papers" | "past-exams" => Category::Exam,
        "assignments" | "assignment" | "homework" => Category::Assignment,
        "other" | "misc" | "others" => Category::Other,
        _ => return None,
    };
    Some(category)
}

/// Case-insensitive category lookup; unknown tokens map to the default.
pub fn map_category_slug_to_category(token: &str) -> Category {
    known_category_slug(token).unwrap_or_default()
}

/// File stem and lower-cased extension of a filename. Names without an
/// extension (or dotfiles) get an empty extension.
pub fn split_extension(filename: &str) -> (&str, String) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() => (stem, ext.to_lowercase()),
        _ => (filename, String::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Calculus II"), "calculus-ii");
        assert_eq!(slugify("  Intro -- to   C++ "), "intro-to-c");
        assert_eq!(slugify("week_3_notes"), "week-3-notes");
        assert_eq!(slugify("!!!"), "");
    }

    #[test]
    fn slugify_is_deterministic() {
        assert_eq!(slugify("Linear Algebra"), slugify("Linear Algebra"));
    }

    #[test]
    fn unslugify_approximates_names() {
        assert_eq!(unslugify("linear-algebra"), "Linear Algebra");
        assert_eq!(unslugify("calculus-ii"), "Calculus Ii");
        assert_eq!(unslugify(""), "");
    }

    #[test]
    fn unique_filenames_differ() {
        let a = generate_unique_filename("Final Exam", "PDF");
        let b = generate_unique_filename("Final Exam", "PDF");
        assert_ne!(a, b);
        assert!(a.starts_with("final-exam_"));
        assert!(a.ends_with(".pdf"));
    }

    #[test]
    fn original_filename_recovers_slug_and_extension() {
        let stored = generate_unique_filename("Week 1: Limits", "pdf");
        assert_eq!(extract_original_filename(&stored), "week-1-limits.pdf");

        let stored = generate_unique_filename("README", "");
        assert_eq!(extract_original_filename(&stored), "readme");
    }

    #[test]
    fn names_without_suffix_are_unchanged() {
        assert_eq!(extract_original_filename("syllabus.pdf"), "syllabus.pdf");
        assert_eq!(extract_original_filename("notes_v2.docx"), "notes_v2.docx");
    }

    #[test]
    fn only_generated_suffixes_are_stripped() {
        assert_eq!(extract_original_filename("report_20231015.pdf"), "report_20231015.pdf");
        assert_eq!(extract_original_filename("dump_deadbeefcafe1234.bin"), "dump_deadbeefcafe1234.bin");
        assert_eq!(extract_original_filename("notes_0123456789ab.pdf"), "notes.pdf");
    }

    #[test]
    fn category_tokens_are_case_insensitive() {
        assert_eq!(map_category_slug_to_category("EXAMS"), Category::Exam);
        assert_eq!(map_category_slug_to_category("Lecture Notes"), Category::LectureNotes);
        assert_eq!(map_category_slug_to_category("homework"), Category::Assignment);
        assert_eq!(map_category_slug_to_category("photos"), Category::Other);
        assert!(known_category_slug("photos").is_none());
    }

    #[test]
    fn canonical_slugs_map_back_to_their_category() {
        for category in Category::ALL {
            assert_eq!(map_category_slug_to_category(category.slug()), category);
        }
    }

    #[test]
    fn split_extension_handles_edge_cases() {
        assert_eq!(split_extension("notes.PDF"), ("notes", "pdf".to_string()));
        assert_eq!(split_extension("Makefile"), ("Makefile", String::new()));
        assert_eq!(split_extension(".hidden"), (".hidden", String::new()));
        assert_eq!(split_extension("archive.tar.gz"), ("archive.tar", "gz".to_string()));
    }
}
