//! Unit tests for statement validation.

use super::*;

#[test]
fn plain_queries_are_accepted() {
    let accepted = [
        "SELECT 1",
        "  select SUM(amount) AS total_sales FROM sales WHERE status = 'COMPLETED'  ",
        "WITH q AS (SELECT region_id, SUM(amount) AS s FROM sales GROUP BY region_id) SELECT * FROM q",
        "SELECT strftime('%Y-%m', order_date) AS month, COUNT(*) FROM sales GROUP BY month",
        "SELECT created_at, updated_at FROM customers",
        "SELECT r.name FROM regions r JOIN sales s ON s.region_id = r.id LIMIT 5",
        "SELECT 1 UNION ALL SELECT 2",
    ];
    for sql in accepted {
        assert_eq!(validate(sql), Ok(()), "{sql}");
    }
}

#[test]
fn mutation_and_ddl_keywords_are_rejected() {
    let rejected = [
        ("INSERT INTO sales VALUES (1)", "INSERT"),
        ("update sales set amount = 0", "UPDATE"),
        ("DELETE FROM sales", "DELETE"),
        ("DROP TABLE sales", "DROP"),
        ("ALTER TABLE sales ADD COLUMN x", "ALTER"),
        ("CREATE TABLE t (a INT)", "CREATE"),
        ("REPLACE INTO sales VALUES (1)", "REPLACE"),
        ("ATTACH DATABASE 'x.db' AS x", "ATTACH"),
        ("PRAGMA writable_schema = 1", "PRAGMA"),
        ("VACUUM", "VACUUM"),
        ("SELECT * FROM sales WHERE id IN (SELECT id FROM x) OR Drop", "DROP"),
        ("WITH d AS (DELETE FROM sales RETURNING *) SELECT * FROM d", "DELETE"),
    ];
    for (sql, keyword) in rejected {
        assert_eq!(
            validate(sql),
            Err(Rejection::ForbiddenKeyword(keyword.to_string())),
            "{sql}"
        );
    }
}

#[test]
fn any_semicolon_is_rejected() {
    for sql in [
        "SELECT 1;",
        "SELECT 1; SELECT 2",
        "SELECT * FROM sales WHERE note = 'a;b'",
    ] {
        assert_eq!(validate(sql), Err(Rejection::Semicolon), "{sql}");
    }
}

#[test]
fn semicolon_check_runs_before_keyword_check() {
    assert_eq!(
        validate("SELECT 1; DROP TABLE sales"),
        Err(Rejection::Semicolon)
    );
}

#[test]
fn keywords_inside_identifiers_are_not_forbidden() {
    for sql in [
        "SELECT created_at FROM sales",
        "SELECT deleted_flag, updates FROM audit",
        "SELECT * FROM sales WHERE status = 'DELETED'",
    ] {
        assert_eq!(validate(sql), Ok(()), "{sql}");
    }
}

#[test]
fn empty_and_garbage_are_rejected() {
    assert_eq!(validate(""), Err(Rejection::Empty));
    assert_eq!(validate("   \n "), Err(Rejection::Empty));
    assert!(matches!(
        validate("the total was 42"),
        Err(Rejection::Unparseable(_))
    ));
}

#[test]
fn non_query_statements_are_rejected() {
    assert_eq!(validate("BEGIN TRANSACTION"), Err(Rejection::NotAQuery));
}

#[test]
fn rejection_messages_name_the_problem() {
    assert_eq!(
        Rejection::ForbiddenKeyword("DROP".to_string()).to_string(),
        "statement contains forbidden keyword DROP"
    );
    assert_eq!(Rejection::Semicolon.to_string(), "statement contains ';'");
}
