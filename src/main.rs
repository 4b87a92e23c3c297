use clap::{Parser, Subcommand};
use gen_image_catalog_lib::config::{default_config_path, ConfigStore};
use gen_image_catalog_lib::database::{ImageAttributeRecord, ImageFlag, PromptEdit, PromptEntry};
use gen_image_catalog_lib::sync::{extract_attributes, SyncStage};
use gen_image_catalog_lib::Catalog;
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(author, version, about = "Catalogs generated images and their embedded prompts.", long_about = None)]
struct Cli {
    /// Config file (defaults to the platform config directory)
    #[arg(long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Store file, overriding the configured one for this run
    #[arg(long, value_name = "FILE", global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Index new and changed images under a directory
    Sync {
        /// Root directory (defaults to the last synced one)
        dir: Option<PathBuf>,
    },
    /// List stored images
    List {
        /// Case-sensitive substring of the prompt or negative prompt
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Show one stored image
    Show {
        id: i64,
        /// Write the stored thumbnail to this file
        #[arg(long, value_name = "FILE")]
        thumbnail_out: Option<PathBuf>,
    },
    /// Toggle the favorite flag
    Fav { id: i64 },
    /// Toggle the NSFW flag
    Nsfw { id: i64 },
    /// Toggle the trash flag
    Trash { id: i64 },
    /// Set the rating
    Rate { id: i64, rating: i64 },
    /// Remove a record from the store (the file is left alone)
    Delete { id: i64 },
    /// Count the words of stored prompts, split on the configured delimiter
    Tags {
        /// Only records at or below this directory
        #[arg(short, long)]
        dir: Option<PathBuf>,
        /// Case-sensitive substring of the prompt or negative prompt
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Print the generation metadata embedded in one file
    Inspect { file: PathBuf },
    /// Manage the prompt library
    #[command(subcommand)]
    Prompt(PromptCommands),
}

#[derive(Subcommand, Debug)]
enum PromptCommands {
    Add {
        title: String,
        prompt: String,
        #[arg(short, long, default_value = "")]
        description: String,
        /// Tags joined by the configured delimiter
        #[arg(short, long)]
        tags: Option<String>,
        /// Preview image to attach
        #[arg(long, value_name = "FILE")]
        image: Option<PathBuf>,
    },
    List {
        #[arg(short, long)]
        keyword: Option<String>,
        #[arg(short, long)]
        tag: Option<String>,
    },
    /// Change the given fields of an entry
    Update {
        id: i64,
        #[arg(long)]
        title: Option<String>,
        #[arg(long)]
        prompt: Option<String>,
        #[arg(short, long)]
        description: Option<String>,
        /// Replaces all tags; joined by the configured delimiter
        #[arg(short, long)]
        tags: Option<String>,
        #[arg(long, value_name = "FILE")]
        image: Option<PathBuf>,
    },
    Show { id: i64 },
    Delete { id: i64 },
    Copy { id: i64 },
    /// Every tag used in the library
    Tags,
}

fn print_record_line(record: &ImageAttributeRecord) {
    let mut marks = String::new();
    if record.fav_flag {
        marks.push('*');
    }
    if record.nsfw_flag {
        marks.push('!');
    }
    if record.trash_flag {
        marks.push('x');
    }
    println!(
        "{:>6}  {:<3} {}/{}  [{}] {}",
        record.id,
        marks,
        record.directory_path,
        record.file_name,
        record.software,
        record.prompt.lines().next().unwrap_or_default()
    );
}

fn print_prompt(entry: &PromptEntry) {
    println!("#{} {}", entry.id, entry.title);
    println!("  prompt:      {}", entry.prompt);
    if !entry.description.is_empty() {
        println!("  description: {}", entry.description);
    }
    if !entry.tags.is_empty() {
        println!("  tags:        {}", entry.tags.join(", "));
    }
    if let Some(image) = &entry.image_data {
        println!("  image:       {} bytes", image.len());
    }
}

fn toggle(catalog: &Catalog, id: i64, flag: ImageFlag) -> Result<(), Box<dyn std::error::Error>> {
    match catalog.db().toggle_flag(id, flag)? {
        Some(value) => println!("#{id} {flag:?}: {value}"),
        None => return Err(format!("no image with id {id}").into()),
    }
    Ok(())
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Cli::parse();

    if let Commands::Inspect { file } = &args.command {
        let attributes = extract_attributes(file)?;
        println!("{}", serde_json::to_string_pretty(&attributes)?);
        return Ok(());
    }

    let config_path = args.config.clone().unwrap_or_else(default_config_path);
    let mut config = ConfigStore::load(&config_path);
    if let Some(db) = args.db.clone() {
        config.override_database_path(db);
    }
    let mut catalog = Catalog::open(config)?;

    match args.command {
        Commands::Sync { dir } => {
            let root = match dir {
                Some(dir) => dir,
                None => catalog
                    .config()
                    .config()
                    .last_directory
                    .clone()
                    .ok_or("no directory given and none remembered")?,
            };
            let report = catalog.sync_directory_with_progress(&root, &|progress| {
                if progress.stage == SyncStage::Indexing
                    && progress.total > 0
                    && (progress.current % 64 == 0 || progress.current == progress.total)
                {
                    log::info!("Indexed {}/{}", progress.current, progress.total);
                }
            })?;
            catalog.remember_directory(&root)?;
            println!(
                "processed: {}, skipped: {}, failed: {}{}",
                report.processed,
                report.skipped,
                report.failed,
                if report.cancelled { " (cancelled)" } else { "" }
            );
        }
        Commands::List { filter } => {
            for record in catalog.list_attributes(filter.as_deref())? {
                print_record_line(&record);
            }
        }
        Commands::Show { id, thumbnail_out } => {
            let record = catalog
                .db()
                .get_by_id(id)?
                .ok_or_else(|| format!("no image with id {id}"))?;
            println!("{}", serde_json::to_string_pretty(&record)?);
            if let Some(out) = thumbnail_out {
                std::fs::write(&out, &record.thumbnail)?;
                println!("thumbnail written to {}", out.display());
            }
        }
        Commands::Fav { id } => toggle(&catalog, id, ImageFlag::Favorite)?,
        Commands::Nsfw { id } => toggle(&catalog, id, ImageFlag::Nsfw)?,
        Commands::Trash { id } => toggle(&catalog, id, ImageFlag::Trash)?,
        Commands::Rate { id, rating } => {
            if !catalog.db().set_rating(id, rating)? {
                return Err(format!("no image with id {id}").into());
            }
        }
        Commands::Delete { id } => {
            if !catalog.db().delete_image(id)? {
                return Err(format!("no image with id {id}").into());
            }
        }
        Commands::Tags { dir, filter } => {
            for entry in catalog.prompt_word_counts(dir.as_deref(), filter.as_deref())? {
                println!("{} ({})", entry.word, entry.count);
            }
        }
        Commands::Inspect { .. } => {}
        Commands::Prompt(command) => match command {
            PromptCommands::Add {
                title,
                prompt,
                description,
                tags,
                image,
            } => {
                let image_data = match image {
                    Some(path) => Some(std::fs::read(path)?),
                    None => None,
                };
                let entry = PromptEntry {
                    title,
                    prompt,
                    description,
                    tags: tags
                        .map(|raw| catalog.split_tag_input(&raw))
                        .unwrap_or_default(),
                    image_data,
                    ..Default::default()
                };
                let id = catalog.db().insert_prompt(&entry)?;
                println!("added prompt #{id}");
            }
            PromptCommands::List { keyword, tag } => {
                for entry in catalog
                    .db()
                    .list_prompts(keyword.as_deref(), tag.as_deref())?
                {
                    print_prompt(&entry);
                }
            }
            PromptCommands::Update {
                id,
                title,
                prompt,
                description,
                tags,
                image,
            } => {
                let image_data = match image {
                    Some(path) => Some(std::fs::read(path)?),
                    None => None,
                };
                let edit = PromptEdit {
                    title,
                    prompt,
                    description,
                    tags: tags.map(|raw| catalog.split_tag_input(&raw)),
                    image_data,
                };
                let entry = catalog
                    .db()
                    .edit_prompt(id, edit)?
                    .ok_or_else(|| format!("no prompt with id {id}"))?;
                print_prompt(&entry);
            }
            PromptCommands::Tags => {
                for tag in catalog.db().prompt_tags()? {
                    println!("{tag}");
                }
            }
            PromptCommands::Show { id } => {
                let entry = catalog
                    .db()
                    .get_prompt(id)?
                    .ok_or_else(|| format!("no prompt with id {id}"))?;
                print_prompt(&entry);
            }
            PromptCommands::Delete { id } => {
                if !catalog.db().delete_prompt(id)? {
                    return Err(format!("no prompt with id {id}").into());
                }
            }
            PromptCommands::Copy { id } => match catalog.db().copy_prompt(id)? {
                Some(new_id) => println!("copied prompt #{id} to #{new_id}"),
                None => return Err(format!("no prompt with id {id}").into()),
            },
        },
    }

    Ok(())
}
