use clap::Args;
use tabsync_core::{CellValue, Content};

use super::replica::LocalReplica;
use super::OutputFormat;

/// Parses a command-line value: JSON numbers and booleans keep their type,
/// anything else is a string.
pub fn parse_cell_value(raw: &str) -> CellValue {
    serde_json::from_str(raw).unwrap_or_else(|_| CellValue::from(raw))
}

#[derive(Args)]
pub struct SetCellArgs {
    /// Table ID
    table: String,
    /// Row ID
    row: String,
    /// Cell ID
    cell: String,
    /// Value (numbers and true/false are typed, anything else is a string)
    value: String,
}

impl SetCellArgs {
    pub async fn run(&self, replica: &LocalReplica) -> Result<(), Box<dyn std::error::Error>> {
        let value = parse_cell_value(&self.value);
        replica
            .store()
            .with(|s| s.set_cell(&self.table, &self.row, &self.cell, value.clone()).map(|_| ()))?;
        replica.save().await;
        println!("Set {}/{}/{} = {}", self.table, self.row, self.cell, value);
        Ok(())
    }
}

#[derive(Args)]
pub struct DelCellArgs {
    /// Table ID
    table: String,
    /// Row ID
    row: String,
    /// Cell ID
    cell: String,
}

impl DelCellArgs {
    pub async fn run(&self, replica: &LocalReplica) -> Result<(), Box<dyn std::error::Error>> {
        replica
            .store()
            .with(|s| s.del_cell(&self.table, &self.row, &self.cell).map(|_| ()))?;
        replica.save().await;
        println!("Deleted {}/{}/{}", self.table, self.row, self.cell);
        Ok(())
    }
}

#[derive(Args)]
pub struct SetValueArgs {
    /// Value ID
    id: String,
    /// Value (numbers and true/false are typed, anything else is a string)
    value: String,
}

impl SetValueArgs {
    pub async fn run(&self, replica: &LocalReplica) -> Result<(), Box<dyn std::error::Error>> {
        let value = parse_cell_value(&self.value);
        replica.store().with(|s| s.set_value(&self.id, value.clone()).map(|_| ()))?;
        replica.save().await;
        println!("Set {} = {}", self.id, value);
        Ok(())
    }
}

#[derive(Args)]
pub struct DelValueArgs {
    /// Value ID
    id: String,
}

impl DelValueArgs {
    pub async fn run(&self, replica: &LocalReplica) -> Result<(), Box<dyn std::error::Error>> {
        replica.store().with(|s| s.del_value(&self.id).map(|_| ()))?;
        replica.save().await;
        println!("Deleted {}", self.id);
        Ok(())
    }
}

#[derive(Args)]
pub struct ShowArgs {
    /// Output format
    #[arg(long, short, value_enum, default_value = "text")]
    format: OutputFormat,
}

impl ShowArgs {
    pub fn run(&self, replica: &LocalReplica) -> Result<(), Box<dyn std::error::Error>> {
        let content = replica.store().with(|s| s.get_content());
        match self.format {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&content)?),
            OutputFormat::Text => print_content(&content),
        }
        Ok(())
    }
}

fn print_content(content: &Content) {
    if content.is_empty() {
        println!("No content.");
        return;
    }

    for (table_id, table) in &content.tables {
        println!("{}", table_id);
        for (row_id, row) in table {
            let cells: Vec<String> = row.iter().map(|(cell_id, value)| format!("{}={}", cell_id, value)).collect();
            println!("  {}: {}", row_id, cells.join(", "));
        }
    }

    if !content.values.is_empty() {
        if !content.tables.is_empty() {
            println!();
        }
        println!("values");
        for (value_id, value) in &content.values {
            println!("  {}={}", value_id, value);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cell_value() {
        assert_eq!(parse_cell_value("3"), CellValue::from(3));
        assert_eq!(parse_cell_value("2.5"), CellValue::from(2.5));
        assert_eq!(parse_cell_value("true"), CellValue::from(true));
        assert_eq!(parse_cell_value("\"42\""), CellValue::from("42"));
        assert_eq!(parse_cell_value("dog"), CellValue::from("dog"));
        assert_eq!(parse_cell_value("[1]"), CellValue::from("[1]"));
    }
}
