//! The interactive command loop.
//!
//! Reads one line at a time from standard input, dispatches meta commands
//! and statements, and prints results. Logical errors (duplicate key, key
//! not found, parse failures) are reported and the loop continues; I/O and
//! integrity errors propagate to the caller, which terminates.

use crate::command::{self, MetaCommand, Statement};
use crate::errors::Error;
use crate::storage::{node, row, Table};
use std::io::{self, BufRead, Write};
use std::path::Path;

pub fn run(path: &Path) -> Result<(), Error> {
    let mut table = Table::open(path)?;
    let stdin = io::stdin();
    let mut input = String::new();

    loop {
        print!("db > ");
        io::stdout().flush()?;

        input.clear();
        if stdin.lock().read_line(&mut input)? == 0 {
            break; // EOF: close cleanly.
        }
        let line = input.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('.') {
            match command::parse_meta(line) {
                Ok(MetaCommand::Exit) => return table.close(),
                Ok(MetaCommand::Btree) => {
                    println!("Tree:");
                    print!("{}", table.print_tree()?);
                }
                Ok(MetaCommand::Constants) => print_constants(),
                Err(e) => println!("{}", e),
            }
            continue;
        }

        match command::parse(line) {
            Ok(statement) => execute_statement(&mut table, statement)?,
            Err(e) => println!("{}", e),
        }
    }

    table.close()
}

fn execute_statement(table: &mut Table, statement: Statement) -> Result<(), Error> {
    match statement {
        Statement::Insert(row) => match table.insert(&row) {
            Ok(()) => println!("Executed."),
            Err(Error::DuplicateKey) => println!("Error: Duplicate key."),
            Err(e) => return Err(e),
        },
        Statement::Select => {
            table.select_all(|row| println!("{}", row))?;
            println!("Executed.");
        }
        Statement::Delete(id) => match table.delete(id) {
            Ok(()) => println!("Executed."),
            Err(Error::KeyNotFound) => println!("Error: Key not found."),
            Err(e) => return Err(e),
        },
    }
    Ok(())
}

fn print_constants() {
    println!("Constants:");
    println!("ROW_SIZE: {}", row::ROW_SIZE);
    println!("COMMON_NODE_HEADER_SIZE: {}", node::COMMON_NODE_HEADER_SIZE);
    println!("LEAF_NODE_HEADER_SIZE: {}", node::LEAF_NODE_HEADER_SIZE);
    println!("LEAF_NODE_CELL_SIZE: {}", node::LEAF_NODE_CELL_SIZE);
    println!("LEAF_NODE_SPACE_FOR_CELLS: {}", node::LEAF_NODE_SPACE_FOR_CELLS);
    println!("LEAF_NODE_MAX_CELLS: {}", node::LEAF_NODE_MAX_CELLS);
}
