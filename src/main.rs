use anyhow::{bail, ensure, Context as _, Result};
use std::sync::{mpsc, Arc};
use waykeys::{KeyCombo, KeyboardCapture, KeyboardEmulation, KeyboardHandler, WaylandTransport};

const USAGE: &str = "\
usage: waykeys type <text>...
       waykeys backspace <count>
       waykeys combo <key>...
       waykeys capture [<key>...]";

enum Cmd {
    Type(String),
    Backspace(usize),
    Combo(KeyCombo),
    Capture(Vec<String>),
}

impl Cmd {
    fn parse(args: &[String]) -> Result<Cmd> {
        let Some((name, args)) = args.split_first() else {
            bail!("no command given\n{USAGE}");
        };
        let cmd = match name.as_str() {
            "type" => {
                ensure!(!args.is_empty(), "type: no text given\n{USAGE}");
                Cmd::Type(args.join(" "))
            }
            "backspace" => {
                ensure!(args.len() == 1, "backspace: expected one count\n{USAGE}");
                let count = args[0]
                    .parse()
                    .with_context(|| format!("backspace: invalid count {:?}", args[0]))?;
                Cmd::Backspace(count)
            }
            "combo" => {
                ensure!(!args.is_empty(), "combo: no keys given\n{USAGE}");
                Cmd::Combo(KeyCombo::chord(args))
            }
            "capture" => Cmd::Capture(args.to_vec()),
            "help" | "-h" | "--help" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            _ => bail!("unknown command {name:?}\n{USAGE}"),
        };
        Ok(cmd)
    }
}

fn capture(handler: &Arc<KeyboardHandler<WaylandTransport>>, keys: Vec<String>) -> Result<()> {
    let (quit, quit_rx) = mpsc::channel();
    let mut capture = KeyboardCapture::new(Arc::clone(handler));
    capture.suppress_keyboard(keys);
    capture.on_key_down(|key| println!("down {key}"));
    capture.on_key_up(move |key| {
        println!("up {key}");
        if key == "Escape" {
            let _ = quit.send(());
        }
    });
    capture.start().context("cannot capture the keyboard")?;
    eprintln!("capturing, press Escape to stop");
    let _ = quit_rx.recv();
    capture.cancel();
    Ok(())
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let cmd = Cmd::parse(&args)?;
    let handler = Arc::new(KeyboardHandler::new(WaylandTransport));
    let emulation = || {
        KeyboardEmulation::new(Arc::clone(&handler)).context("cannot emulate keyboard events")
    };
    match cmd {
        Cmd::Type(text) => emulation()?.send_string(&text)?,
        Cmd::Backspace(count) => emulation()?.send_backspaces(count)?,
        Cmd::Combo(combo) => emulation()?
            .send_key_combination(&combo)
            .context("cannot send key combination")?,
        Cmd::Capture(keys) => capture(&handler, keys)?,
    }
    Ok(())
}
