// Packaging assets for capsync, written under OUT_DIR:
//
//   man/capsync.1, man/capsync-<command>.1
//   completions/ for every shell clap_complete knows
//
// The CLI definition is compiled here on its own; it needs nothing beyond
// the build-dependencies.

use std::io;
use std::path::{Path, PathBuf};

use clap::{Command, CommandFactory};
use clap_complete::Shell;

#[path = "src/cli.rs"]
mod cli;

const BIN: &str = "capsync";

const SHELLS: [Shell; 5] = [
    Shell::Bash,
    Shell::Zsh,
    Shell::Fish,
    Shell::PowerShell,
    Shell::Elvish,
];

fn main() -> io::Result<()> {
    println!("cargo::rerun-if-changed=src/cli.rs");

    let out_dir: PathBuf = std::env::var_os("OUT_DIR")
        .ok_or_else(|| io::Error::other("OUT_DIR is only set when run by cargo"))?
        .into();

    let mut cmd = cli::Cli::command().name(BIN);
    write_man_pages(&cmd, &subdir(&out_dir, "man")?)?;
    write_completions(&mut cmd, &subdir(&out_dir, "completions")?)
}

fn subdir(out_dir: &Path, name: &str) -> io::Result<PathBuf> {
    let dir = out_dir.join(name);
    std::fs::create_dir_all(&dir)?;
    Ok(dir)
}

/// One page for the binary, one per visible command (`capsync-run.1`, ...).
fn write_man_pages(cmd: &Command, dir: &Path) -> io::Result<()> {
    let page = dir.join(format!("{}.1", cmd.get_name()));
    let mut roff = Vec::new();
    clap_mangen::Man::new(cmd.clone()).render(&mut roff)?;
    std::fs::write(page, roff)?;

    let visible = cmd.get_subcommands().filter(|sub| !sub.is_hide_set());
    for sub in visible {
        let qualified = sub
            .clone()
            .name(format!("{}-{}", cmd.get_name(), sub.get_name()));
        write_man_pages(&qualified, dir)?;
    }
    Ok(())
}

fn write_completions(cmd: &mut Command, dir: &Path) -> io::Result<()> {
    for shell in SHELLS {
        clap_complete::generate_to(shell, cmd, BIN, dir)?;
    }
    Ok(())
}
