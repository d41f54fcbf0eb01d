/*
 * imap-engine - imap
 *
 * Copyright 2017 - 2024 Manos Pitsidianakis
 *
 * This file is part of imap-engine.
 *
 * imap-engine is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * imap-engine is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with imap-engine. If not, see <http://www.gnu.org/licenses/>.
 */

use rusty_fork::rusty_fork_test;

rusty_fork_test! {
    #[test]
    fn test_session_against_scripted_server() {
        tests::run_session();
    }
}

pub mod server {
    use std::net::{TcpListener, TcpStream};

    use futures::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
    use imap_engine::smol::Async;

    /// Greets with `greeting`, then expects each command line in order and
    /// answers it. Returns once the client closes the connection.
    pub async fn serve(
        listener: Async<TcpListener>,
        greeting: &'static str,
        script: Vec<(&'static str, String)>,
    ) {
        let (stream, _) = listener.accept().await.unwrap();
        let stream: &Async<TcpStream> = &stream;
        let mut reader = BufReader::new(stream);
        let mut writer = stream;
        writer.write_all(greeting.as_bytes()).await.unwrap();
        let mut line = String::new();
        for (expected, reply) in script {
            line.clear();
            reader.read_line(&mut line).await.unwrap();
            eprintln!("server received: {:?}", line);
            assert_eq!(line, expected);
            writer.write_all(reply.as_bytes()).await.unwrap();
            writer.flush().await.unwrap();
        }
        line.clear();
        assert_eq!(reader.read_line(&mut line).await.unwrap(), 0, "{:?}", line);
    }
}

pub mod tests {
    use std::{
        net::TcpListener,
        sync::{Arc, Mutex},
    };

    use imap_engine::{
        conf::{EngineConf, ImapServerConf, Transport},
        imap::{
            cache::{CacheHandle, MemoryCache},
            scheduler::ConnectionState,
            EngineEvent, EventConsumer, ExponentialBackoff, ImapSession,
        },
        smol::{self, Async},
    };

    use super::server;

    pub fn run_session() {
        smol::block_on(async {
            let listener = Async::<TcpListener>::bind(([127, 0, 0, 1], 0)).unwrap();
            let port = listener.get_ref().local_addr().unwrap().port();
            let script = vec![
                (
                    "y0 LOGIN user pass\r\n",
                    "y0 OK [CAPABILITY IMAP4rev1 UIDPLUS] logged in\r\n".to_string(),
                ),
                (
                    "y1 SELECT INBOX\r\n",
                    "* 2 EXISTS\r\n* OK [UIDVALIDITY 7] ok\r\n* OK [UIDNEXT 10] ok\r\ny1 OK \
                     [READ-WRITE] done\r\n"
                        .to_string(),
                ),
                (
                    "y2 UID SEARCH ALL\r\n",
                    "* SEARCH 3 6\r\ny2 OK done\r\n".to_string(),
                ),
                (
                    "y3 UID FETCH 1:* (FLAGS)\r\n",
                    "* 1 FETCH (UID 3 FLAGS (\\Seen))\r\n* 2 FETCH (UID 6 FLAGS ())\r\ny3 OK \
                     done\r\n"
                        .to_string(),
                ),
                (
                    "y4 UID FETCH 6 BODY.PEEK[1]\r\n",
                    "* 2 FETCH (UID 6 BODY[1] {5}\r\nhello)\r\ny4 OK done\r\n".to_string(),
                ),
                (
                    "y5 LOGOUT\r\n",
                    "* BYE see you\r\ny5 OK done\r\n".to_string(),
                ),
            ];
            let server = smol::spawn(server::serve(
                listener,
                "* OK [CAPABILITY IMAP4rev1 UIDPLUS] ready\r\n",
                script,
            ));

            let mut server_conf = ImapServerConf::new("127.0.0.1", "user", "pass", Transport::Tcp);
            server_conf.server_port = Some(port);
            let mut conf = EngineConf::new(server_conf);
            conf.prefetch_count = 0;
            conf.extension_use.idle = false;
            conf.extension_use.deflate = false;
            let reconnect = Box::new(ExponentialBackoff::from(&conf.reconnect));

            let events = Arc::new(Mutex::new(vec![]));
            let consumer = {
                let events = events.clone();
                EventConsumer::new(Arc::new(move |ev| events.lock().unwrap().push(ev)))
            };
            let (session, driver) = ImapSession::new(
                conf,
                CacheHandle::new(Box::new(MemoryCache::new())),
                consumer,
                reconnect,
            )
            .unwrap();
            let driver = smol::spawn(driver);

            let (_, state) = session.open_mailbox("INBOX", false).await.unwrap();
            assert_eq!(state.uidvalidity, Some(7));
            assert_eq!(state.uidnext, Some(10));
            assert_eq!(
                session.fetch_part("INBOX", 6, "1").await.unwrap(),
                b"hello".to_vec()
            );
            let seen = session
                .inspect(|model| {
                    let mailbox = model.mailbox_by_name("INBOX").unwrap();
                    model
                        .mailbox(mailbox)
                        .unwrap()
                        .messages
                        .iter()
                        .map(|m| (m.uid, m.is_seen()))
                        .collect::<Vec<_>>()
                })
                .await
                .unwrap();
            assert_eq!(seen, vec![(Some(3), true), (Some(6), false)]);

            session.shutdown().await.unwrap();
            driver.await.unwrap();
            server.await;

            // The session is gone: requests fail instead of hanging.
            assert!(session.noop().await.is_err());

            let events = events.lock().unwrap();
            assert!(events.iter().any(|ev| matches!(
                ev,
                EngineEvent::ConnectionStateChanged {
                    state: ConnectionState::Authenticated,
                    ..
                }
            )));
            assert!(!events
                .iter()
                .any(|ev| matches!(ev, EngineEvent::ConnectionLost(_))));
        });
    }
}
