//! Splits the text of a migration file into individual statements.
//!
//! The splitter is deliberately simple: it does not tokenize SQL. Every `--`
//! starts a comment that runs to the end of the line and every `;` ends a
//! statement, even inside quoted literals. `/* */` block comments are passed
//! through untouched. Migrations that need a literal `;` or `--` must avoid
//! this form.

/// Returns the non-empty statements of `text` in source order.
#[must_use]
pub fn split_statements(text: &str) -> Vec<String> {
    let without_comments = text
        .lines()
        .map(|line| line.find("--").map_or(line, |start| &line[..start]))
        .collect::<Vec<_>>()
        .join("\n");

    without_comments
        .split(';')
        .map(str::trim)
        .filter(|statement| !statement.is_empty())
        .map(ToString::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn drops_comment_lines_and_trailing_fragment() {
        let text = "-- create the users table\nCREATE TABLE users (id INTEGER); -- inline\n";

        assert_eq!(split_statements(text), vec!["CREATE TABLE users (id INTEGER)"]);
    }

    #[test]
    fn keeps_statement_order() {
        let text = "CREATE TABLE a (id INTEGER);\nCREATE TABLE b (id INTEGER);\nINSERT INTO a VALUES (1)";

        assert_eq!(
            split_statements(text),
            vec![
                "CREATE TABLE a (id INTEGER)",
                "CREATE TABLE b (id INTEGER)",
                "INSERT INTO a VALUES (1)",
            ]
        );
    }

    #[test]
    fn joins_multi_line_statements() {
        let text = "CREATE TABLE projects (\n    id INTEGER, -- key\n    name TEXT\n);\r\n";

        assert_eq!(
            split_statements(text),
            vec!["CREATE TABLE projects (\n    id INTEGER, \n    name TEXT\n)"]
        );
    }

    #[test]
    fn empty_and_comment_only_input_yield_nothing() {
        assert!(split_statements("").is_empty());
        assert!(split_statements("  ;\n;;\n-- nothing here;\n").is_empty());
    }

    #[test]
    fn terminator_inside_literal_still_splits() {
        let text = "INSERT INTO notes (body) VALUES ('a;b');";

        assert_eq!(
            split_statements(text),
            vec!["INSERT INTO notes (body) VALUES ('a", "b')"]
        );
    }

    #[test]
    fn comment_marker_inside_literal_still_strips() {
        let text = "INSERT INTO notes (body) VALUES ('--not a comment');";

        assert_eq!(
            split_statements(text),
            vec!["INSERT INTO notes (body) VALUES ('"]
        );
    }

    #[test]
    fn block_comments_are_not_understood() {
        let text = "/* header; still header */ CREATE TABLE t (id INTEGER);";

        assert_eq!(
            split_statements(text),
            vec!["/* header", "still header */ CREATE TABLE t (id INTEGER)"]
        );
    }
}
