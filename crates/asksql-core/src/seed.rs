//! Demo warehouse matching the built-in knowledge base.
//!
//! Regions, products, customers, daily sales with a busier Q4, invoices for a
//! share of the completed sales and weekly expenses. Generation is driven by a
//! seeded RNG, so the same options always produce the same data.

use std::path::Path;

use chrono::{Datelike, Duration, NaiveDate, Utc};
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Sqlite, Transaction};

use crate::error::{Error, Result};

/// Schema of the demo warehouse.
pub const DEMO_SCHEMA: &str = r#"
CREATE TABLE regions (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL UNIQUE,
    country TEXT NOT NULL DEFAULT 'Bangladesh',
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE products (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT NOT NULL,
    unit_price REAL NOT NULL,
    cost_price REAL NOT NULL,
    description TEXT,
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE customers (
    id INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    email TEXT,
    phone TEXT,
    region_id INTEGER REFERENCES regions(id),
    customer_type TEXT NOT NULL DEFAULT 'retail',
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE sales (
    id INTEGER PRIMARY KEY,
    order_date DATE NOT NULL,
    product_id INTEGER NOT NULL REFERENCES products(id),
    customer_id INTEGER NOT NULL REFERENCES customers(id),
    region_id INTEGER NOT NULL REFERENCES regions(id),
    quantity INTEGER NOT NULL,
    unit_price REAL NOT NULL,
    discount REAL NOT NULL DEFAULT 0,
    amount REAL NOT NULL,
    status TEXT NOT NULL DEFAULT 'COMPLETED',
    payment_method TEXT,
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE INDEX idx_sales_order_date ON sales(order_date);
CREATE INDEX idx_sales_status ON sales(status);

CREATE TABLE invoices (
    id INTEGER PRIMARY KEY,
    invoice_number TEXT NOT NULL UNIQUE,
    sale_id INTEGER REFERENCES sales(id),
    invoice_date DATE NOT NULL,
    due_date DATE,
    total_amount REAL NOT NULL,
    paid_amount REAL NOT NULL DEFAULT 0,
    status TEXT NOT NULL DEFAULT 'PENDING',
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);

CREATE TABLE expenses (
    id INTEGER PRIMARY KEY,
    expense_date DATE NOT NULL,
    category TEXT NOT NULL,
    description TEXT,
    amount REAL NOT NULL,
    region_id INTEGER REFERENCES regions(id),
    created_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
);
"#;

const REGIONS: &[&str] = &["Dhaka", "Chattogram", "Sylhet", "Rajshahi", "Khulna"];

// (name, category, unit price, cost price, description)
const PRODUCTS: &[(&str, &str, f64, f64, &str)] = &[
    ("Laptop Pro 15", "Electronics", 85_000.0, 70_000.0, "High-performance laptop"),
    ("Smartphone X12", "Electronics", 45_000.0, 35_000.0, "Flagship smartphone"),
    ("Wireless Headphones", "Electronics", 5_000.0, 3_000.0, "Bluetooth headphones"),
    ("Office Chair Ergonomic", "Furniture", 15_000.0, 10_000.0, "Ergonomic office chair"),
    ("Standing Desk", "Furniture", 25_000.0, 18_000.0, "Adjustable standing desk"),
    ("LED Monitor 27inch", "Electronics", 22_000.0, 16_000.0, "4K LED monitor"),
    ("Mechanical Keyboard", "Electronics", 8_000.0, 5_000.0, "RGB mechanical keyboard"),
    ("Printer Multifunction", "Electronics", 18_000.0, 12_000.0, "All-in-one printer"),
    ("Notebook Pack (100)", "Stationery", 2_000.0, 1_200.0, "Pack of 100 notebooks"),
    ("Pen Set Premium", "Stationery", 500.0, 250.0, "Premium pen set"),
];

const CUSTOMERS: &[&str] = &[
    "ABC Corporation",
    "XYZ Traders",
    "Tech Solutions Ltd",
    "Global Imports",
    "City Electronics",
    "Metro Supplies",
    "Delta Trading",
    "Sunrise Enterprises",
    "Pacific Group",
    "Summit Industries",
    "Valley Distributors",
    "Horizon Ltd",
];

const CUSTOMER_TYPES: &[&str] = &["retail", "wholesale", "corporate"];

// Weighted toward completed orders.
const STATUSES: &[&str] = &[
    "COMPLETED",
    "COMPLETED",
    "COMPLETED",
    "COMPLETED",
    "PENDING",
    "CANCELLED",
];

const PAYMENT_METHODS: &[&str] = &["Cash", "Card", "Bank Transfer", "Mobile Banking"];

const DISCOUNTS: &[f64] = &[0.0, 0.0, 0.0, 500.0, 1_000.0, 2_000.0];

const EXPENSE_CATEGORIES: &[(&str, u32, u32)] = &[
    ("Salary", 50_000, 200_000),
    ("Rent", 20_000, 100_000),
    ("Utilities", 5_000, 20_000),
    ("Marketing", 10_000, 50_000),
    ("Transportation", 5_000, 30_000),
    ("Office Supplies", 2_000, 10_000),
];

const MAX_INVOICES: usize = 3_000;
const INVOICE_DUE_DAYS: i64 = 30;

/// What to generate.
#[derive(Debug, Clone)]
pub struct SeedOptions {
    /// First order date.
    pub start: NaiveDate,
    /// Last order date, inclusive.
    pub end: NaiveDate,
    pub seed: u64,
}

impl Default for SeedOptions {
    fn default() -> Self {
        Self {
            start: NaiveDate::from_ymd_opt(2023, 1, 1).unwrap_or_default(),
            end: Utc::now().date_naive(),
            seed: 42,
        }
    }
}

/// Rows written per table.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SeedReport {
    pub regions: usize,
    pub products: usize,
    pub customers: usize,
    pub sales: usize,
    pub invoices: usize,
    pub expenses: usize,
}

struct CompletedSale {
    id: i64,
    date: NaiveDate,
    amount: f64,
}

/// Create a demo warehouse at `path`. Refuses to touch an existing file.
pub async fn seed_demo_warehouse(path: &Path, options: &SeedOptions) -> Result<SeedReport> {
    if path.exists() {
        return Err(Error::InvalidInput(format!(
            "warehouse '{}' already exists",
            path.display()
        )));
    }
    if options.end < options.start {
        return Err(Error::InvalidInput(format!(
            "seed range ends ({}) before it starts ({})",
            options.end, options.start
        )));
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let connect = SqliteConnectOptions::new()
        .filename(path)
        .create_if_missing(true)
        .foreign_keys(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(connect)
        .await?;
    sqlx::raw_sql(DEMO_SCHEMA).execute(&pool).await?;

    let mut rng = fastrand::Rng::with_seed(options.seed);
    let mut tx = pool.begin().await?;
    let mut report = SeedReport {
        regions: insert_regions(&mut tx).await?,
        products: insert_products(&mut tx).await?,
        customers: insert_customers(&mut tx, &mut rng).await?,
        ..SeedReport::default()
    };
    let completed = insert_sales(&mut tx, &mut rng, options, &mut report).await?;
    report.invoices = insert_invoices(&mut tx, &mut rng, &completed, options.end).await?;
    report.expenses = insert_expenses(&mut tx, &mut rng, options).await?;
    tx.commit().await?;
    pool.close().await;

    tracing::info!(
        path = %path.display(),
        sales = report.sales,
        invoices = report.invoices,
        expenses = report.expenses,
        "seeded demo warehouse"
    );
    Ok(report)
}

async fn insert_regions(tx: &mut Transaction<'_, Sqlite>) -> Result<usize> {
    for (id, name) in (1_i64..).zip(REGIONS) {
        sqlx::query("INSERT INTO regions (id, name, country) VALUES (?, ?, 'Bangladesh')")
            .bind(id)
            .bind(*name)
            .execute(&mut **tx)
            .await?;
    }
    Ok(REGIONS.len())
}

async fn insert_products(tx: &mut Transaction<'_, Sqlite>) -> Result<usize> {
    for (id, (name, category, unit_price, cost_price, description)) in (1_i64..).zip(PRODUCTS) {
        sqlx::query(
            r#"
            INSERT INTO products (id, name, category, unit_price, cost_price, description)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(*name)
        .bind(*category)
        .bind(*unit_price)
        .bind(*cost_price)
        .bind(*description)
        .execute(&mut **tx)
        .await?;
    }
    Ok(PRODUCTS.len())
}

async fn insert_customers(
    tx: &mut Transaction<'_, Sqlite>,
    rng: &mut fastrand::Rng,
) -> Result<usize> {
    for (id, name) in (1_i64..).zip(CUSTOMERS) {
        let domain: String = name
            .chars()
            .filter(|c| !c.is_whitespace())
            .collect::<String>()
            .to_lowercase();
        sqlx::query(
            r#"
            INSERT INTO customers (id, name, email, phone, region_id, customer_type)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(id)
        .bind(*name)
        .bind(format!("contact@{domain}.com"))
        .bind(format!("+880 1{}", rng.u32(700_000_000..=999_999_999)))
        .bind(pick_id(rng, REGIONS.len()))
        .bind(*pick(rng, CUSTOMER_TYPES))
        .execute(&mut **tx)
        .await?;
    }
    Ok(CUSTOMERS.len())
}

async fn insert_sales(
    tx: &mut Transaction<'_, Sqlite>,
    rng: &mut fastrand::Rng,
    options: &SeedOptions,
    report: &mut SeedReport,
) -> Result<Vec<CompletedSale>> {
    let mut completed = Vec::new();
    let mut id = 0_i64;

    for date in days(options.start, options.end) {
        let orders = match date.month() {
            10..=12 => rng.u32(8..=20),
            1..=3 => rng.u32(3..=10),
            _ => rng.u32(5..=15),
        };
        for _ in 0..orders {
            id += 1;
            let product_index = rng.usize(..PRODUCTS.len());
            let unit_price = PRODUCTS[product_index].2;
            let quantity = rng.u32(1..=10);
            let discount = *pick(rng, DISCOUNTS);
            let amount = f64::from(quantity) * unit_price - discount;
            let status = *pick(rng, STATUSES);

            sqlx::query(
                r#"
                INSERT INTO sales (
                    id, order_date, product_id, customer_id, region_id, quantity,
                    unit_price, discount, amount, status, payment_method
                )
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(id)
            .bind(date.to_string())
            .bind(index_id(product_index))
            .bind(pick_id(rng, CUSTOMERS.len()))
            .bind(pick_id(rng, REGIONS.len()))
            .bind(quantity)
            .bind(unit_price)
            .bind(discount)
            .bind(amount)
            .bind(status)
            .bind(*pick(rng, PAYMENT_METHODS))
            .execute(&mut **tx)
            .await?;

            report.sales += 1;
            if status == "COMPLETED" {
                completed.push(CompletedSale { id, date, amount });
            }
        }
    }
    Ok(completed)
}

/// Invoices for roughly a third of the completed sales.
async fn insert_invoices(
    tx: &mut Transaction<'_, Sqlite>,
    rng: &mut fastrand::Rng,
    completed: &[CompletedSale],
    today: NaiveDate,
) -> Result<usize> {
    let mut written = 0;
    for sale in completed {
        if written >= MAX_INVOICES {
            break;
        }
        if rng.u8(..3) != 0 {
            continue;
        }

        let paid = if rng.f64() < 0.8 {
            sale.amount
        } else {
            (sale.amount * (0.5 + 0.4 * rng.f64())).round()
        };
        let due = sale.date + Duration::days(INVOICE_DUE_DAYS);
        let status = if paid >= sale.amount {
            "PAID"
        } else if due < today {
            "OVERDUE"
        } else {
            "PENDING"
        };

        sqlx::query(
            r#"
            INSERT INTO invoices (
                invoice_number, sale_id, invoice_date, due_date, total_amount, paid_amount, status
            )
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(format!("INV-{}", 1000 + written))
        .bind(sale.id)
        .bind(sale.date.to_string())
        .bind(due.to_string())
        .bind(sale.amount)
        .bind(paid)
        .bind(status)
        .execute(&mut **tx)
        .await?;
        written += 1;
    }
    Ok(written)
}

/// Weekly expenses; each category has a 70% chance per week.
async fn insert_expenses(
    tx: &mut Transaction<'_, Sqlite>,
    rng: &mut fastrand::Rng,
    options: &SeedOptions,
) -> Result<usize> {
    let mut written = 0;
    for date in days(options.start, options.end).step_by(7) {
        for (category, min, max) in EXPENSE_CATEGORIES {
            if rng.f64() >= 0.7 {
                continue;
            }
            sqlx::query(
                r#"
                INSERT INTO expenses (expense_date, category, description, amount, region_id)
                VALUES (?, ?, ?, ?, ?)
                "#,
            )
            .bind(date.to_string())
            .bind(*category)
            .bind(format!("{category} expense for the week"))
            .bind(f64::from(rng.u32(*min..=*max)))
            .bind(pick_id(rng, REGIONS.len()))
            .execute(&mut **tx)
            .await?;
            written += 1;
        }
    }
    Ok(written)
}

fn days(start: NaiveDate, end: NaiveDate) -> impl Iterator<Item = NaiveDate> {
    start.iter_days().take_while(move |day| *day <= end)
}

fn pick<'a, T>(rng: &mut fastrand::Rng, items: &'a [T]) -> &'a T {
    &items[rng.usize(..items.len())]
}

/// Random 1-based id into a table of `len` rows.
fn pick_id(rng: &mut fastrand::Rng, len: usize) -> i64 {
    index_id(rng.usize(..len))
}

fn index_id(index: usize) -> i64 {
    i64::try_from(index).map_or(1, |i| i + 1)
}
