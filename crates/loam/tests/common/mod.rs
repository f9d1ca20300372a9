//! Shared fixtures: a connection helper and example persisted types,
//! including a two-level hierarchy.

#![allow(dead_code)]

use loam::{DatabaseConnection, Error, Id, Persistent, Result};

/// An open in-memory connection with the widget schema applied.
pub fn widget_conn() -> DatabaseConnection {
    let conn = DatabaseConnection::new();
    conn.open(":memory:").expect("in-memory database opens");
    conn.execute_sql(
        "create table widgets(widget_id integer primary key autoincrement, \
         label text not null, count integer not null check(count >= 0), \
         serial integer not null, ratio float not null)",
    )
    .expect("widget schema applies");
    conn
}

/// An open in-memory connection with the account hierarchy schema.
pub fn account_conn() -> DatabaseConnection {
    let conn = DatabaseConnection::new();
    conn.open(":memory:").expect("in-memory database opens");
    conn.execute_sql(
        "create table accounts(account_id integer primary key autoincrement, \
         name text not null); \
         create table savings_accounts(account_id integer primary key \
         references accounts(account_id), rate float not null)",
    )
    .expect("account schema applies");
    conn
}

/// A standalone persisted type: one row in `widgets`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Widget {
    pub label: String,
    pub count: i32,
    pub serial: i64,
    pub ratio: f64,
}

impl Persistent for Widget {
    type Base = Widget;

    fn primary_table_name() -> &'static str {
        "widgets"
    }

    fn primary_key_name() -> &'static str {
        "widget_id"
    }

    fn do_load(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt = conn.statement(
            "select label, count, serial, ratio from widgets where widget_id = :p",
        )?;
        stmt.bind(":p", id)?;
        if !stmt.step()? {
            return Err(Error::BadIdentifier {
                table: "widgets",
                id,
            });
        }
        self.label = stmt.extract(0)?;
        self.count = stmt.extract(1)?;
        self.serial = stmt.extract(2)?;
        self.ratio = stmt.extract(3)?;
        Ok(())
    }

    fn do_save_new(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt = conn.statement(
            "insert into widgets(widget_id, label, count, serial, ratio) \
             values(:id, :label, :count, :serial, :ratio)",
        )?;
        stmt.bind(":id", id)?;
        stmt.bind(":label", self.label.as_str())?;
        stmt.bind(":count", self.count)?;
        stmt.bind(":serial", self.serial)?;
        stmt.bind(":ratio", self.ratio)?;
        stmt.step_final()
    }

    fn do_save_existing(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt = conn.statement(
            "update widgets set label = :label, count = :count, \
             serial = :serial, ratio = :ratio where widget_id = :id",
        )?;
        stmt.bind(":id", id)?;
        stmt.bind(":label", self.label.as_str())?;
        stmt.bind(":count", self.count)?;
        stmt.bind(":serial", self.serial)?;
        stmt.bind(":ratio", self.ratio)?;
        stmt.step_final()
    }
}

/// Base of the account hierarchy; owns the primary-key sequence.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Account {
    pub name: String,
}

impl Persistent for Account {
    type Base = Account;

    fn primary_table_name() -> &'static str {
        "accounts"
    }

    fn primary_key_name() -> &'static str {
        "account_id"
    }

    fn do_load(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt = conn.statement("select name from accounts where account_id = :p")?;
        stmt.bind(":p", id)?;
        if !stmt.step()? {
            return Err(Error::BadIdentifier {
                table: "accounts",
                id,
            });
        }
        self.name = stmt.extract(0)?;
        Ok(())
    }

    fn do_save_new(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt =
            conn.statement("insert into accounts(account_id, name) values(:id, :name)")?;
        stmt.bind(":id", id)?;
        stmt.bind(":name", self.name.as_str())?;
        stmt.step_final()
    }

    fn do_save_existing(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt = conn.statement("update accounts set name = :name where account_id = :id")?;
        stmt.bind(":id", id)?;
        stmt.bind(":name", self.name.as_str())?;
        stmt.step_final()
    }
}

/// Sub-type of [`Account`]: shares the base table and primary-key
/// sequence, stores its own fields in `savings_accounts`.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SavingsAccount {
    pub name: String,
    pub rate: f64,
}

impl Persistent for SavingsAccount {
    type Base = Account;

    fn primary_table_name() -> &'static str {
        "accounts"
    }

    fn exclusive_table_name() -> &'static str {
        "savings_accounts"
    }

    fn primary_key_name() -> &'static str {
        "account_id"
    }

    fn do_load(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut stmt = conn.statement(
            "select a.name, s.rate from accounts a \
             join savings_accounts s on s.account_id = a.account_id \
             where a.account_id = :p",
        )?;
        stmt.bind(":p", id)?;
        if !stmt.step()? {
            return Err(Error::BadIdentifier {
                table: "savings_accounts",
                id,
            });
        }
        self.name = stmt.extract(0)?;
        self.rate = stmt.extract(1)?;
        Ok(())
    }

    fn do_save_new(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        // Base exclusive table first, then this type's own table.
        let mut base =
            conn.statement("insert into accounts(account_id, name) values(:id, :name)")?;
        base.bind(":id", id)?;
        base.bind(":name", self.name.as_str())?;
        base.step_final()?;
        let mut own =
            conn.statement("insert into savings_accounts(account_id, rate) values(:id, :rate)")?;
        own.bind(":id", id)?;
        own.bind(":rate", self.rate)?;
        own.step_final()
    }

    fn do_save_existing(&mut self, conn: &DatabaseConnection, id: Id) -> Result<()> {
        let mut base = conn.statement("update accounts set name = :name where account_id = :id")?;
        base.bind(":id", id)?;
        base.bind(":name", self.name.as_str())?;
        base.step_final()?;
        let mut own =
            conn.statement("update savings_accounts set rate = :rate where account_id = :id")?;
        own.bind(":id", id)?;
        own.bind(":rate", self.rate)?;
        own.step_final()
    }
}
