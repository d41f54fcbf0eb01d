extern crate imap_engine;

use std::{path::Path, sync::Arc};

use imap_engine::{
    conf::{EngineConf, ImapServerConf, Transport},
    futures::{AsyncBufReadExt, StreamExt},
    imap::{
        cache::CacheHandle,
        command::{SearchKey, SearchQuery, ThreadAlgorithm},
        model::FlagSet,
        task::FlagOperation,
        EngineEvent, EventConsumer, ExponentialBackoff, ImapSession, NetworkPolicy, UID,
    },
    smol, Error, Result, StderrLogger,
};

/// Opens an interactive shell on an IMAP server. Suggested use is with
/// rlwrap(1)
///
/// # Example invocation:
/// ```sh
/// ./imapshell server_hostname server_username server_password server_port
/// ./imapshell --config account.toml
/// ```
///
/// Type `help` for the list of commands.

const HELP: &str = "Commands:
  list [PARENT]                      list child mailboxes
  select MAILBOX | examine MAILBOX   open and synchronize a mailbox
  messages MAILBOX                   show the synchronized message list
  status MAILBOX
  fetch MAILBOX UID [PART]           print a body part, the whole message by default
  flags MAILBOX +|-|= FLAG[,FLAG] UID...
  search MAILBOX all|seen|unseen|flagged|subject TEXT|from TEXT|body TEXT|text TEXT
  thread MAILBOX references|orderedsubject [SEARCH KEY]
  copy MAILBOX TARGET UID... | move MAILBOX TARGET UID...
  expunge MAILBOX
  create NAME | delete NAME | rename FROM TO
  subscribe NAME | unsubscribe NAME
  online | offline | expensive
  noop | help | quit";

fn conf_from_args() -> Result<EngineConf> {
    let args = std::env::args().skip(1).collect::<Vec<String>>();
    match args.as_slice() {
        [flag, path] if flag == "--config" => EngineConf::from_path(Path::new(path)),
        [hostname, username, password, port] => {
            let mut server = ImapServerConf::new(
                hostname.as_str(),
                username.as_str(),
                password.as_str(),
                Transport::Tls,
            );
            server.server_port = Some(
                port.parse()
                    .map_err(|_| Error::new(format!("Invalid port {}", port)))?,
            );
            server.danger_accept_invalid_certs = true;
            let conf = EngineConf::new(server);
            conf.validate()?;
            Ok(conf)
        }
        _ => {
            eprintln!(
                "Usage: imapshell server_hostname server_username server_password server_port\n       \
                 imapshell --config FILE"
            );
            std::process::exit(1);
        }
    }
}

fn parse_uids(args: &[&str]) -> Result<Vec<UID>> {
    args.iter()
        .map(|s| {
            s.parse::<UID>()
                .map_err(|_| Error::new(format!("Invalid UID {}", s)))
        })
        .collect()
}

fn parse_search(args: &[&str]) -> Result<SearchKey> {
    let text = || args[1..].join(" ");
    Ok(match args.first().copied() {
        None | Some("all") => SearchKey::All,
        Some("seen") => SearchKey::Seen,
        Some("unseen") => SearchKey::Unseen,
        Some("flagged") => SearchKey::Flagged,
        Some("subject") => SearchKey::Subject(text()),
        Some("from") => SearchKey::From(text()),
        Some("body") => SearchKey::Body(text()),
        Some("text") => SearchKey::Text(text()),
        Some(other) => return Err(Error::new(format!("Unknown search key {}", other))),
    })
}

async fn run_command(session: &ImapSession, line: &str) -> Result<bool> {
    let words = line.split_whitespace().collect::<Vec<&str>>();
    let Some((cmd, args)) = words.split_first() else {
        return Ok(true);
    };
    let usage = || Error::new(format!("Wrong arguments for `{}`, see `help`.", cmd));
    match (*cmd, args) {
        ("help", _) => println!("{}", HELP),
        ("quit" | "exit", _) => return Ok(false),
        ("list", args) => {
            for mailbox in session
                .list_mailboxes(args.first().copied().unwrap_or(""))
                .await?
            {
                println!(
                    "{}{} {}",
                    if mailbox.is_subscribed { "*" } else { " " },
                    mailbox.name,
                    mailbox.attributes.join(" ")
                );
            }
        }
        (verb @ ("select" | "examine"), [mailbox]) => {
            let (_, state) = session.open_mailbox(mailbox, verb == "examine").await?;
            println!(
                "{} messages, UIDVALIDITY {:?}, UIDNEXT {:?}",
                state.exists.unwrap_or(0),
                state.uidvalidity,
                state.uidnext
            );
        }
        ("messages", [mailbox]) => {
            let name = mailbox.to_string();
            let lines = session
                .inspect(move |model| {
                    let Some(mailbox) = model.mailbox_by_name(&name).and_then(|id| model.mailbox(id))
                    else {
                        return vec![];
                    };
                    mailbox
                        .messages
                        .iter()
                        .enumerate()
                        .map(|(i, m)| {
                            format!(
                                "{:>5} uid {:<8} {} {}",
                                i + 1,
                                m.uid.map(|u| u.to_string()).unwrap_or_default(),
                                if m.is_seen() { " " } else { "N" },
                                m.envelope
                                    .as_ref()
                                    .and_then(|e| e.subject.clone())
                                    .unwrap_or_default()
                            )
                        })
                        .collect::<Vec<String>>()
                })
                .await?;
            for l in lines {
                println!("{}", l);
            }
        }
        ("status", [mailbox]) => println!("{:?}", session.mailbox_status(mailbox).await?),
        ("fetch", [mailbox, uid, rest @ ..]) => {
            let uid = parse_uids(&[*uid])?[0];
            let part = rest.first().copied().unwrap_or("");
            let data = session.fetch_part(mailbox, uid, part).await?;
            println!("{}", String::from_utf8_lossy(&data));
        }
        ("flags", [mailbox, op, flags, uids @ ..]) if !uids.is_empty() => {
            let operation = match *op {
                "+" => FlagOperation::Add,
                "-" => FlagOperation::Remove,
                "=" => FlagOperation::Replace,
                _ => return Err(usage()),
            };
            let flags = FlagSet::from_names(flags.split(','));
            session
                .update_flags(mailbox, parse_uids(uids)?, operation, flags)
                .await?;
        }
        ("search", [mailbox, query @ ..]) => {
            let uids = session
                .search(mailbox, SearchQuery::new(vec![parse_search(query)?]))
                .await?;
            println!("{:?}", uids);
        }
        ("thread", [mailbox, algorithm, query @ ..]) => {
            let algorithm = algorithm.parse::<ThreadAlgorithm>().map_err(Error::new)?;
            let threads = session
                .thread(mailbox, algorithm, SearchQuery::new(vec![parse_search(query)?]))
                .await?;
            for node in threads {
                let uid = node.uid.map(|uid| uid.to_string());
                println!(
                    "{:indent$}{}",
                    "",
                    uid.as_deref().unwrap_or("(missing)"),
                    indent = node.depth * 2
                );
            }
        }
        ("copy", [mailbox, target, uids @ ..]) if !uids.is_empty() => {
            session
                .copy_messages(mailbox, parse_uids(uids)?, target)
                .await?
        }
        ("move", [mailbox, target, uids @ ..]) if !uids.is_empty() => {
            session
                .move_messages(mailbox, parse_uids(uids)?, target)
                .await?
        }
        ("expunge", [mailbox]) => session.expunge(mailbox).await?,
        ("create", [name]) => session.create_mailbox(name).await?,
        ("delete", [name]) => session.delete_mailbox(name).await?,
        ("rename", [from, to]) => session.rename_mailbox(from, to).await?,
        ("subscribe", [name]) => session.subscribe(name).await?,
        ("unsubscribe", [name]) => session.unsubscribe(name).await?,
        ("online", []) => session.set_network_policy(NetworkPolicy::Online).await?,
        ("offline", []) => session.set_network_policy(NetworkPolicy::Offline).await?,
        ("expensive", []) => session.set_network_policy(NetworkPolicy::Expensive).await?,
        ("noop", []) => session.noop().await?,
        _ => return Err(usage()),
    }
    Ok(true)
}

fn main() -> Result<()> {
    let conf = conf_from_args()?;
    let _logger = StderrLogger::new(conf.log_level);
    let cache = CacheHandle::from_conf(&conf.cache);
    let reconnect = Box::new(ExponentialBackoff::from(&conf.reconnect));
    let consumer = EventConsumer::new(Arc::new(|ev| match ev {
        EngineEvent::Alert(text) => eprintln!("ALERT: {}", text),
        EngineEvent::ConnectionLost(err) => eprintln!("connection lost: {}", err),
        EngineEvent::CacheFailure(err) => eprintln!("cache disabled: {}", err),
        ev => imap_engine::log::debug!("{:?}", ev),
    }));
    let (session, driver) = ImapSession::new(conf, cache, consumer, reconnect)?;

    smol::block_on(async move {
        let driver = smol::spawn(driver);
        let mut lines = smol::io::BufReader::new(smol::Unblock::new(std::io::stdin())).lines();
        while let Some(line) = lines.next().await {
            match run_command(&session, &line?).await {
                Ok(true) => {}
                Ok(false) => break,
                Err(err) => eprintln!("{}", err),
            }
        }
        session.shutdown().await?;
        driver.await
    })
}
