use rust_block_db::engine::{ColumnType, Database, QueryResult};
use rust_block_db::sql::ParamValue;
use rust_block_db::{DatabaseConfig, DbError, Value};
use std::thread;

fn setup(dir: &tempfile::TempDir) -> Database {
    let db = Database::open(DatabaseConfig::new(dir.path())).unwrap();

    let mut f = db.create_table_factory();
    f.start_table("emp");
    f.add_column("id", ColumnType::BigInt).unwrap();
    f.add_column("name", ColumnType::Varchar(20)).unwrap();
    f.add_column("dept", ColumnType::Int).unwrap();
    f.add_column("salary", ColumnType::Double).unwrap();
    db.add_table(f.create().unwrap()).unwrap();

    f.start_table("dept");
    f.add_column("id", ColumnType::Int).unwrap();
    f.add_column("title", ColumnType::Varchar(20)).unwrap();
    db.add_table(f.create().unwrap()).unwrap();

    let inserted = db
        .execute(
            "INSERT INTO emp VALUES (1, 'ada', 10, 120.5), (2, 'bob', 20, 80), \
             (3, 'cy', 10, 93.5), (4, 'di', NULL, NULL)",
            &[],
        )
        .unwrap();
    assert_eq!(inserted, QueryResult::Inserted(4));
    db.execute("INSERT INTO dept (title, id) VALUES ('eng', 10), ('ops', 20)", &[])
        .unwrap();
    db
}

fn rows(db: &Database, sql: &str, params: &[ParamValue]) -> Vec<Vec<Value>> {
    match db.execute(sql, params).unwrap() {
        QueryResult::Rows(rs) => rs.rows,
        other => panic!("expected rows from {sql}, got {other:?}"),
    }
}

fn scalar(db: &Database, sql: &str) -> Value {
    let mut r = rows(db, sql, &[]);
    assert_eq!(r.len(), 1, "{sql}");
    r.remove(0).remove(0)
}

#[test]
fn integer_arithmetic_is_exact() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);
    assert_eq!(scalar(&db, "SELECT 3 + 4"), Value::Long(7));
    assert_eq!(scalar(&db, "SELECT 7 % 4 * -2"), Value::Long(-6));
    assert_eq!(scalar(&db, "SELECT 9007199254740993 + 0"), Value::Long(9_007_199_254_740_993));
}

#[test]
fn floating_operand_widens() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);
    assert_eq!(scalar(&db, "SELECT 3 + 2.5"), Value::Double(5.5));
    assert_eq!(scalar(&db, "SELECT 7 / 2"), Value::Long(3));
    assert_eq!(scalar(&db, "SELECT 7 / 2.0"), Value::Double(3.5));
}

#[test]
fn null_comparisons_are_unknown() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);
    assert_eq!(scalar(&db, "SELECT NULL = NULL"), Value::Null);
    assert_eq!(scalar(&db, "SELECT NULL <> 1"), Value::Null);
    assert_eq!(scalar(&db, "SELECT NULL IS NULL"), Value::Boolean(true));

    // the NULL dept row satisfies neither the predicate nor its negation
    assert_eq!(rows(&db, "SELECT id FROM emp WHERE dept = 10 OR NOT dept = 10", &[]).len(), 3);
    assert_eq!(rows(&db, "SELECT id FROM emp WHERE dept IS NULL", &[]), vec![vec![Value::Long(4)]]);
}

#[test]
fn ordering_compares_as_doubles_and_equality_as_text() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);
    assert_eq!(scalar(&db, "SELECT '10' < '9'"), Value::Boolean(false));
    assert_eq!(scalar(&db, "SELECT 'b' = 'b'"), Value::Boolean(true));
    assert_eq!(scalar(&db, "SELECT '1' = 1"), Value::Boolean(true));
    assert_eq!(scalar(&db, "SELECT 1 = 1.0"), Value::Boolean(true));
    assert!(matches!(db.execute("SELECT 'x' < 1", &[]), Err(DbError::Conversion(_))));
}

#[test]
fn filters_projections_and_joins() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);

    let mut high = rows(&db, "SELECT name, salary * 2 AS doubled FROM emp WHERE salary >= 93.5", &[]);
    high.sort_by(|a, b| a[0].to_text().cmp(&b[0].to_text()));
    assert_eq!(
        high,
        vec![
            vec![Value::Text("ada".into()), Value::Double(241.0)],
            vec![Value::Text("cy".into()), Value::Double(187.0)],
        ]
    );

    let mut joined = rows(
        &db,
        "SELECT e.name, d.title FROM emp e, dept d WHERE e.dept = d.id AND d.title = 'eng'",
        &[],
    );
    joined.sort_by(|a, b| a[0].to_text().cmp(&b[0].to_text()));
    assert_eq!(
        joined,
        vec![
            vec![Value::Text("ada".into()), Value::Text("eng".into())],
            vec![Value::Text("cy".into()), Value::Text("eng".into())],
        ]
    );

    match db.execute("SELECT d.*, 1 FROM dept d WHERE id = 20", &[]).unwrap() {
        QueryResult::Rows(rs) => {
            assert_eq!(rs.columns, vec!["id", "title", "1"]);
            assert_eq!(rs.rows, vec![vec![Value::Long(20), Value::Text("ops".into()), Value::Long(1)]]);
        }
        other => panic!("unexpected {other:?}"),
    }
}

#[test]
fn aggregates_over_the_whole_result() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);

    let r = rows(
        &db,
        "SELECT COUNT(*), COUNT(dept), SUM(dept), MIN(salary), MAX(name), AVG(salary) FROM emp",
        &[],
    );
    assert_eq!(
        r,
        vec![vec![
            Value::Long(4),
            Value::Long(3),
            Value::Long(40),
            Value::Double(80.0),
            Value::Text("di".into()),
            Value::Double(98.0),
        ]]
    );

    let empty = rows(&db, "SELECT COUNT(*), SUM(id) FROM emp WHERE id > 100", &[]);
    assert_eq!(empty, vec![vec![Value::Long(0), Value::Null]]);
}

#[test]
fn parameters_bind_per_execution() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);

    let by_id = "SELECT name FROM emp WHERE id = ?1";
    assert_eq!(rows(&db, by_id, &[ParamValue::Long(2)]), vec![vec![Value::Text("bob".into())]]);
    assert_eq!(rows(&db, by_id, &[ParamValue::Str("3".into())]), vec![vec![Value::Text("cy".into())]]);
    assert!(rows(&db, by_id, &[ParamValue::Null]).is_empty());

    assert_eq!(scalar(&db, "SELECT ?"), Value::Null);
    assert_eq!(rows(&db, "SELECT ? + 1", &[ParamValue::Boolean(true)]), vec![vec![Value::Double(2.0)]]);
    assert!(matches!(
        db.execute("SELECT ? + 1", &[ParamValue::Str("abc".into())]),
        Err(DbError::Conversion(_))
    ));

    db.execute("INSERT INTO dept VALUES (?, ?)", &[ParamValue::Long(30), ParamValue::Str("qa".into())])
        .unwrap();
    assert_eq!(
        rows(&db, "SELECT title FROM dept WHERE id = ?", &[ParamValue::Long(30)]),
        vec![vec![Value::Text("qa".into())]]
    );
}

#[test]
fn compile_errors_run_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);

    let err = db.execute("SELECT TRUE + 1", &[]).unwrap_err();
    assert!(matches!(err, DbError::Bind(_)));
    assert!(err.to_string().contains("can't cope"));
    assert!(matches!(db.execute("SELECT * FROM nowhere", &[]), Err(DbError::TableNotFound(_))));
    assert!(matches!(db.execute("SELECT FROM emp", &[]), Err(DbError::Parse(_))));
    assert!(matches!(
        db.execute("INSERT INTO dept VALUES (1, 'x'), (2)", &[]),
        Err(DbError::Bind(_))
    ));
    assert_eq!(scalar(&db, "SELECT COUNT(*) FROM dept"), Value::Long(2));
}

#[test]
fn evaluation_errors_fail_the_query() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);
    assert!(matches!(db.execute("SELECT 1 / 0", &[]), Err(DbError::Eval(_))));
    assert!(matches!(db.execute("SELECT id % 0 FROM emp", &[]), Err(DbError::Eval(_))));
    assert!(matches!(
        db.execute("SELECT 9223372036854775807 + 1", &[]),
        Err(DbError::Eval(_))
    ));
}

#[test]
fn failed_multi_row_insert_stores_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);

    assert!(matches!(
        db.execute("INSERT INTO dept VALUES (30, 'qa'), (1 / 0, 'b')", &[]),
        Err(DbError::Eval(_))
    ));
    assert!(matches!(
        db.execute("INSERT INTO dept VALUES (30, 'qa'), (40, 'a title far too long to fit')", &[]),
        Err(DbError::Schema(_))
    ));
    assert!(db
        .execute("INSERT INTO dept VALUES (30, 'qa'), (?, 'b')", &[ParamValue::Str("x".into())])
        .is_err());
    assert_eq!(scalar(&db, "SELECT COUNT(*) FROM dept"), Value::Long(2));
}

#[test]
fn parse_query_returns_unbound_fresh_queries() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);

    let mut q = db.parse_query("SELECT id FROM emp WHERE name = ?").unwrap();
    assert!(!q.is_bound());
    assert!(q.execute(&db, &q.new_params()).is_err());

    q.bind().unwrap();
    q.bind().unwrap();
    let mut params = q.new_params();
    params.get_mut(1).unwrap().set_string("ada");
    assert_eq!(q.execute(&db, &params).unwrap().rows().unwrap().rows, vec![vec![Value::Long(1)]]);
}

#[test]
fn independent_queries_run_concurrently() {
    let dir = tempfile::tempdir().unwrap();
    let db = setup(&dir);
    let sql = "SELECT name FROM emp WHERE id = ?";

    thread::scope(|s| {
        for id in 1..=3i64 {
            let db = &db;
            s.spawn(move || {
                let mut q = db.parse_query(sql).unwrap();
                q.bind().unwrap();
                let expected = ["ada", "bob", "cy"][id as usize - 1];
                for _ in 0..50 {
                    let mut params = q.new_params();
                    params.get_mut(1).unwrap().set_long(id);
                    let result = q.execute(db, &params).unwrap();
                    assert_eq!(result.rows().unwrap().rows, vec![vec![Value::Text(expected.into())]]);
                }
            });
        }
        // the cached plan is shared too, each call with its own slots
        for id in 1..=3i64 {
            let db = &db;
            s.spawn(move || {
                for _ in 0..50 {
                    let r = rows(db, sql, &[ParamValue::Long(id)]);
                    assert_eq!(r.len(), 1);
                }
            });
        }
    });
}
