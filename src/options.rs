use std::fs::File;
use std::io::{BufRead, BufReader};

use crate::error::LinkError;
use crate::link::Link;
use crate::mapfile::StandardMapEncoder;
use crate::noice::NoIceMapEncoder;
use crate::output::{IhxEncoder, S19Encoder};
use crate::target::TargetCli;

/// Option letters that consume the remainder of their argument token.
const EXTENDED_OPTIONS: &str = "KLHBG";
/// Flag-only option letters handled by the generic driver.
const SINGLE_CHAR_OPTIONS: &str = "MXDQISUEJ";

const USAGE_HELP_TEXT: &[&str] = &[
    "Startup:",
    "  -c                           Command line input",
    "  -f   file[LNK]               File input",
    "  -p   Prompt and echo of file[LNK] to stdout (default)",
    "  -n   No echo of file[LNK] to stdout",
    "Usage: [-Options] file [file ...]",
    "Librarys:",
    "  -k\tLibrary path specification, one per -k",
    "  -l\tLibrary file specification, one per -l",
    "Relocation:",
    "  -b   area base address = expression",
    "  -g   global symbol = expression",
    "Map format:",
    "  -m   Map output generated as file[MAP]",
    "  -x   Hexadecimal (default)",
    "  -d   Decimal",
    "  -q   Octal",
    "Banking:",
    "  -hfile  file specification containing assignments of modules to banks",
    "Output:",
    "  -i   Intel Hex as file[IHX]",
    "  -s   Motorola S19 as file[S19]",
    "  -j   Produce NoICE debug as file[NOI]",
    "List:",
    "  -u\tUpdate listing file(s) with link data as file(s)[.RST]",
    "End:",
    "  -e   or null line terminates input",
    "",
];

/// Writes the linker banner and option summary, with the target's
/// additions, to stderr.
pub fn give_usage_info(link: &Link) {
    let mut text = String::from("\nASxxxx Linker \n\n");
    for line in USAGE_HELP_TEXT {
        text.push_str(line);
        text.push('\n');
    }
    text.push_str(&link.target.usage_info());
    eprint!("{text}");
}

fn add_options_from_reader(
    reader: &mut dyn BufRead,
    collected: &mut Vec<String>,
    lines_are_echoed: bool,
) -> Result<(), LinkError> {
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line)? == 0 {
            return Ok(());
        }
        if lines_are_echoed {
            eprint!("{line}");
        }
        let line = line.trim_end_matches(['\r', '\n']);
        if line.is_empty() {
            return Ok(());
        }
        collected.push(line.to_string());
    }
}

fn add_options_from_file(
    file_name: &str,
    collected: &mut Vec<String>,
    lines_are_echoed: bool,
) -> Result<(), LinkError> {
    let file = File::open(file_name).map_err(|source| LinkError::FileOpen {
        path: file_name.to_string(),
        source,
    })?;
    add_options_from_reader(&mut BufReader::new(file), collected, lines_are_echoed)
}

/// Scans the raw command line for `-c`/`-f` option-file inclusions and
/// `-n`/`-p` echo switches and returns the combined argument stream.
pub fn collect_options(
    arguments: &[String],
    lines_are_echoed: &mut bool,
) -> Result<Vec<String>, LinkError> {
    let mut collected = Vec::new();
    let mut previous_was_file_flag = false;

    for argument in arguments {
        if previous_was_file_flag {
            // an -f option must be directly followed by a file name
            add_options_from_file(argument, &mut collected, *lines_are_echoed)?;
            previous_was_file_flag = false;
            continue;
        }
        if !argument.starts_with('-') {
            collected.push(argument.clone());
            continue;
        }

        for (position, ch) in argument[1..].chars().enumerate() {
            if !ch.is_ascii_alphabetic() {
                break;
            }
            match ch.to_ascii_uppercase() {
                'C' => {
                    let stdin = std::io::stdin();
                    add_options_from_reader(
                        &mut stdin.lock(),
                        &mut collected,
                        *lines_are_echoed,
                    )?;
                }
                'F' => previous_was_file_flag = true,
                'N' => *lines_are_echoed = false,
                'P' => *lines_are_echoed = true,
                _ => {
                    if position == 0 {
                        collected.push(argument.clone());
                    }
                    break;
                }
            }
        }
    }
    Ok(collected)
}

fn is_link_file_intro_character(ch: char) -> bool {
    ch.is_ascii_alphanumeric() || ch == '_'
}

/// Evaluates the collected argument stream: link file names, generic
/// options, and target-specific options through the target hook.
pub fn process_options(link: &mut Link, arguments: &[String]) -> Result<(), LinkError> {
    let mut handled = vec![false; arguments.len()];
    let mut all_options_are_known = true;

    let mut index = 0;
    while index < arguments.len() {
        let argument = arguments[index].clone();
        let slot = index;
        index += 1;
        if handled[slot] {
            continue;
        }
        let Some(first) = argument.chars().next() else {
            continue;
        };

        if is_link_file_intro_character(first) {
            if link.options.stem.is_empty() {
                // the first file name only provides the output stem
                let dot = argument.rfind('.').unwrap_or(argument.len());
                link.options.stem = argument[..dot].to_string();
            } else {
                link.options.link_files.push(argument);
            }
            handled[slot] = true;
            continue;
        }
        if first != '-' {
            continue;
        }

        let Some(letter) = argument.chars().nth(1) else {
            link.diag
                .warning("plain '-' option on command line ignored");
            all_options_are_known = false;
            continue;
        };
        if !letter.is_ascii_alphabetic() {
            continue;
        }
        let letter = letter.to_ascii_uppercase();

        if EXTENDED_OPTIONS.contains(letter) {
            handled[slot] = true;
            let value = argument[2..].to_string();
            match letter {
                'B' => link.tables.base_address_list.push(value),
                'G' => link.tables.global_def_list.push(value),
                'H' => link
                    .banking
                    .read_configuration_file(&value, &mut link.diag)?,
                'K' => link.libraries.add_directory(&value),
                'L' => {
                    if !link.libraries.add_file_path_name(&value) {
                        link.diag
                            .warning(&format!("couldn't find library '{value}'"));
                    }
                }
                _ => unreachable!(),
            }
        } else if SINGLE_CHAR_OPTIONS.contains(letter) {
            handled[slot] = true;
            match letter {
                'D' => link.options.radix = 10,
                'Q' => link.options.radix = 8,
                'X' => link.options.radix = 16,
                'E' => {
                    // ignore all remaining options
                    for remaining in handled.iter_mut().skip(slot) {
                        *remaining = true;
                    }
                }
                'I' => link.options.ihx = true,
                'S' => link.options.s19 = true,
                'U' => link.options.update_listings = true,
                'M' => {
                    link.maps
                        .register(".map", Box::new(StandardMapEncoder), &mut link.diag)?;
                }
                'J' => {
                    link.maps.register(
                        ".noi",
                        Box::new(NoIceMapEncoder::default()),
                        &mut link.diag,
                    )?;
                }
                _ => unreachable!(),
            }
        }
    }

    {
        let Link {
            target,
            outputs,
            maps,
            tables,
            diag,
            options,
            ..
        } = link;
        target.handle_command_line(&mut TargetCli {
            stem: &options.stem,
            arguments,
            handled: &mut handled,
            outputs,
            maps,
            tables,
            diag,
        })?;
    }

    for (slot, argument) in arguments.iter().enumerate() {
        if !handled[slot] {
            link.diag
                .warning(&format!("unknown commandline option: {argument}"));
            all_options_are_known = false;
        }
    }
    if !all_options_are_known {
        give_usage_info(link);
    }

    link.parser_defaults.default_base = link.options.radix;

    if link.options.ihx {
        let path = format!("{}.ihx", link.options.stem);
        let Link { outputs, diag, .. } = link;
        outputs.create_file(&path, Box::new(IhxEncoder), diag)?;
    }
    if link.options.s19 {
        let path = format!("{}.s19", link.options.stem);
        let Link { outputs, diag, .. } = link;
        outputs.create_file(&path, Box::new(S19Encoder), diag)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_arguments_are_collected_verbatim() {
        let mut echo = true;
        let collected = collect_options(
            &["-i".into(), "main.o".into(), "other.o".into()],
            &mut echo,
        )
        .unwrap();
        assert_eq!(collected, vec!["-i", "main.o", "other.o"]);
        assert!(echo);
    }

    #[test]
    fn echo_switches_are_consumed() {
        let mut echo = true;
        let collected = collect_options(&["-n".into(), "main.o".into()], &mut echo).unwrap();
        assert_eq!(collected, vec!["main.o"]);
        assert!(!echo);
    }
}
