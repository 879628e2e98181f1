use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use fuser::MountOption;

use unionfs::config::UnionConfig;
use unionfs::fs::{UnionFs, CTL_FILE};
use unionfs::policy::{CopyUpPolicy, CreatePolicy};
use unionfs::union::Union;

#[derive(Parser)]
#[command(name = "unionfs")]
#[command(about = "Stackable union filesystem over ordered directory branches")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Args)]
struct BranchArgs {
    /// Branch list, top first: `br:/upper=rw:/lower=ro`
    #[arg(long = "br")]
    branches: Option<String>,

    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Copy-up target policy (overrides the config file)
    #[arg(long, value_enum)]
    copyup: Option<CopyUpPolicy>,

    /// Create target policy (overrides the config file)
    #[arg(long, value_enum)]
    create: Option<CreatePolicy>,
}

#[derive(Subcommand)]
enum Commands {
    /// Mount the union in the foreground
    Mount {
        #[command(flatten)]
        branches: BranchArgs,

        /// Allow other users to access the mount
        #[arg(long)]
        allow_other: bool,

        /// Mount point
        mountpoint: PathBuf,
    },

    /// Send a branch command to a mounted union, or print its branches
    Branch {
        /// Mount point of the union
        mountpoint: PathBuf,

        /// `add:<path>=<perm>[@<pos>]`, `del:<id>`, `mod:<id>=<perm>`,
        /// `reorder:<id>,...`, `target:<dir>=<id>` or `untarget:<dir>`
        command: Option<String>,
    },

    /// List a directory of the union without mounting it
    Ls {
        #[command(flatten)]
        branches: BranchArgs,

        #[arg(default_value = "/")]
        path: String,
    },

    /// Show which branch supplies a path
    Which {
        #[command(flatten)]
        branches: BranchArgs,

        path: String,
    },
}

impl BranchArgs {
    fn config(&self) -> Result<UnionConfig> {
        let mut config = match &self.config {
            Some(file) => UnionConfig::from_file(file)?,
            None => UnionConfig::default(),
        };
        if let Some(spec) = &self.branches {
            config.branches = UnionConfig::parse_branches(spec)?;
        }
        if let Some(copyup) = self.copyup {
            config.copyup = copyup;
        }
        if let Some(create) = self.create {
            config.create = create;
        }
        Ok(config)
    }

    fn open(&self) -> Result<Union> {
        Ok(Union::from_config(&self.config()?)?)
    }
}

fn ctl_path(mountpoint: &Path) -> Result<PathBuf> {
    let mountpoint = mountpoint
        .canonicalize()
        .with_context(|| format!("mount point {}", mountpoint.display()))?;
    Ok(mountpoint.join(CTL_FILE))
}

fn main() -> Result<()> {
    env_logger::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Mount {
            branches,
            allow_other,
            mountpoint,
        } => {
            let union = Arc::new(branches.open()?);
            std::fs::create_dir_all(&mountpoint)?;
            let mountpoint = mountpoint.canonicalize()?;

            let mut options = vec![
                MountOption::FSName("unionfs".to_string()),
                MountOption::Subtype("unionfs".to_string()),
                MountOption::DefaultPermissions,
            ];
            if allow_other {
                options.push(MountOption::AllowOther);
            }

            log::info!("mounting at {}", mountpoint.display());
            fuser::mount2(UnionFs::new(union), &mountpoint, &options)
                .with_context(|| format!("mount at {}", mountpoint.display()))?;
        }

        Commands::Branch {
            mountpoint,
            command,
        } => {
            let ctl = ctl_path(&mountpoint)?;
            match command {
                Some(command) => {
                    let mut file = std::fs::OpenOptions::new()
                        .write(true)
                        .open(&ctl)
                        .with_context(|| {
                            format!("open control file (is {} mounted?)", mountpoint.display())
                        })?;
                    file.write_all(command.as_bytes())
                        .with_context(|| format!("branch command '{}' failed", command))?;
                    println!("ok: {}", command);
                }
                None => {
                    let mut listing = String::new();
                    std::fs::File::open(&ctl)
                        .and_then(|mut f| f.read_to_string(&mut listing))
                        .with_context(|| format!("read {}", ctl.display()))?;
                    print!("{}", listing);
                }
            }
        }

        Commands::Ls { branches, path } => {
            let union = branches.open()?;
            let mut entries = union.list_directory(&path)?;
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            for entry in entries {
                println!("{:<10} {}", format!("{:?}", entry.kind).to_lowercase(), entry.name);
            }
        }

        Commands::Which { branches, path } => {
            let union = branches.open()?;
            let resolved = union.resolve(&path)?;
            let listing = union.branches();
            println!("{}: {:?}", resolved.path, resolved.kind);
            for (index, layer) in resolved.layers.iter().enumerate() {
                let role = if index == resolved.effective {
                    "effective"
                } else if resolved.present_at(index) {
                    "below"
                } else if layer.whiteout {
                    "whiteout"
                } else {
                    continue;
                };
                let storage = listing
                    .get(index)
                    .map(|b| b.storage.as_str())
                    .unwrap_or("-");
                println!("  [{}] branch {} {:<10} {}", index, layer.branch, role, storage);
            }
        }
    }

    Ok(())
}
