use anyhow::{Result, bail};
use serde::Serialize;

use super::{DeleteArgs, HighlightsCommand, ListArgs, OutputFormat, confirm, format, print_json};
use crate::config::Config;
use crate::db::Database;
use crate::model::{HighlightFilter, StoredHighlight};

#[derive(Serialize)]
struct HighlightPage<'a> {
    count: i64,
    limit: u32,
    offset: u32,
    highlights: &'a [StoredHighlight],
}

pub async fn handle_highlights(command: &HighlightsCommand, cfg: &Config) -> Result<i32> {
    let db = Database::new(&cfg.database_path(None)).await?;

    let code = match command {
        HighlightsCommand::List(args) => list(&db, args).await?,
        HighlightsCommand::Books { format: fmt } => {
            let books = db.books().await?;
            match fmt {
                OutputFormat::Text => println!("{}", format::book_table(&books)),
                OutputFormat::Json => print_json(&books)?,
                OutputFormat::Csv => print!("{}", format::csv_rows(&books)?),
            }
            0
        }
        HighlightsCommand::Delete(args) => delete(&db, args).await?,
    };

    db.close().await;
    Ok(code)
}

async fn list(db: &Database, args: &ListArgs) -> Result<i32> {
    let filter = HighlightFilter {
        title: args.title.clone(),
        author: args.author.clone(),
        text: args.text.clone(),
        limit: args.limit,
        offset: args.offset,
    };

    let total = db.count_highlights(&filter).await?;
    let highlights = db.list_highlights(&filter).await?;

    match args.format {
        OutputFormat::Text => {
            if highlights.is_empty() {
                println!("No highlights found matching the criteria.");
            } else {
                println!("{}", format::highlight_list(&highlights, total, &filter));
            }
        }
        OutputFormat::Json => print_json(&HighlightPage {
            count: total,
            limit: filter.limit,
            offset: filter.offset,
            highlights: &highlights,
        })?,
        OutputFormat::Csv => print!("{}", format::csv_rows(&highlights)?),
    }
    Ok(0)
}

async fn delete(db: &Database, args: &DeleteArgs) -> Result<i32> {
    if let Some(id) = args.id {
        if !args.force && !confirm(&format!("Delete highlight {}?", id))? {
            println!("Deletion cancelled.");
            return Ok(0);
        }
        if !db.delete_highlight(id).await? {
            bail!("highlight {} not found", id);
        }
        tracing::info!(id, "deleted highlight");
        println!("Deleted highlight {}.", id);
        return Ok(0);
    }

    let Some(title) = args.book.as_deref() else {
        bail!("pass --id or --book");
    };
    let target = match &args.author {
        Some(author) => format!("'{}' by {}", title, author),
        None => format!("'{}'", title),
    };

    if !args.force && !confirm(&format!("Delete all highlights from {}?", target))? {
        println!("Deletion cancelled.");
        return Ok(0);
    }

    let deleted = db
        .delete_highlights_by_book(title, args.author.as_deref())
        .await?;
    if deleted == 0 {
        println!("No highlights found for {}.", target);
    } else {
        tracing::info!(title, deleted, "deleted highlights of book");
        println!("Deleted {} highlights from {}.", deleted, target);
    }
    Ok(0)
}
