//! Chess Session - Console Module
//!
//! A line-oriented command console over a [`SessionRegistry`], for
//! development and operations. One command per line; every command
//! answers with one or more lines.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::move_generator::MoveGenerator;
use crate::pgn;
use crate::position::{Move, Position};
use crate::registry::SessionRegistry;
use crate::san;
use crate::session::{GameId, PlayerId, SessionHandle, TerminationReason};
use crate::types::Color;

/// Deepest perft the console will run.
const MAX_PERFT_DEPTH: usize = 6;

const HELP: &str = "\
commands:
  new <white> <black> [fen <FEN>]   start a game and select it
  use <game-id>                     load a stored game and select it
  import <file>                     import a PGN file and select it
  move <player> <move>              play a move (UCI or SAN)
  resign <white|black>              end the game by resignation
  timeout <white|black>             end the game on time
  draw                              end the game by agreement
  abort                             abort the game
  show                              board, FEN and status
  moves                             legal moves in the current position
  pgn                               export the game as PGN
  checkpoint                        persist without evicting
  evict                             persist and unload the game
  perft [depth]                     count move-tree leaves (depth 1..=6, default 1)
  quit";

/// Console state: the registry and the currently selected game.
pub struct Console {
    registry: Arc<SessionRegistry>,
    current: Option<GameId>,
    running: bool,
}

impl Console {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Console {
            registry,
            current: None,
            running: true,
        }
    }

    pub fn current(&self) -> Option<GameId> {
        self.current
    }

    /// Read commands from `input` until EOF or `quit`.
    pub async fn run<R, W>(&mut self, input: R, mut output: W) -> std::io::Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut lines = input.lines();
        while let Some(line) = lines.next_line().await? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            for reply in self.process_command(line).await {
                output.write_all(reply.as_bytes()).await?;
                output.write_all(b"\n").await?;
            }
            output.flush().await?;
            if !self.running {
                break;
            }
        }
        Ok(())
    }

    /// Execute one command line and return the reply lines.
    pub async fn process_command(&mut self, line: &str) -> Vec<String> {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some((&command, args)) = parts.split_first() else {
            return Vec::new();
        };

        let reply = match command {
            "new" => self.cmd_new(args).await,
            "use" => self.cmd_use(args).await,
            "import" => self.cmd_import(args).await,
            "move" => self.cmd_move(args).await,
            "resign" => self.cmd_end(args, TerminationReason::Resignation).await,
            "timeout" => self.cmd_end(args, TerminationReason::Timeout).await,
            "draw" => self.terminate(TerminationReason::DrawAgreement).await,
            "abort" => self.terminate(TerminationReason::Aborted).await,
            "show" => self.cmd_show().await,
            "moves" => self.cmd_moves().await,
            "pgn" => self.cmd_pgn().await,
            "checkpoint" => self.cmd_checkpoint().await,
            "evict" => self.cmd_evict().await,
            "perft" => self.cmd_perft(args).await,
            "help" => Ok(vec![HELP.to_string()]),
            "quit" => {
                self.running = false;
                Ok(Vec::new())
            }
            other => Err(format!("unknown command: {other} (try 'help')")),
        };
        reply.unwrap_or_else(|err| vec![format!("error: {err}")])
    }

    async fn selected(&self) -> Result<SessionHandle, String> {
        let id = self.current.ok_or("no game selected")?;
        self.registry.get_or_load(id).await.map_err(|e| e.to_string())
    }

    fn select(&mut self, handle: &SessionHandle) -> Vec<String> {
        self.current = Some(handle.id());
        vec![format!("game {}", handle.id())]
    }

    async fn cmd_new(&mut self, args: &[&str]) -> Result<Vec<String>, String> {
        let [white, black, rest @ ..] = args else {
            return Err("usage: new <white> <black> [fen <FEN>]".to_string());
        };
        let (white, black) = (PlayerId::new(*white), PlayerId::new(*black));
        let handle = match rest {
            [] => self.registry.start_game(white, black).await,
            ["fen", fen @ ..] if !fen.is_empty() => {
                self.registry.start_game_from_fen(white, black, &fen.join(" ")).await
            }
            _ => return Err("usage: new <white> <black> [fen <FEN>]".to_string()),
        }
        .map_err(|e| e.to_string())?;
        Ok(self.select(&handle))
    }

    async fn cmd_use(&mut self, args: &[&str]) -> Result<Vec<String>, String> {
        let id: GameId = args
            .first()
            .ok_or("usage: use <game-id>")?
            .parse()
            .map_err(|e| format!("bad game id: {e}"))?;
        let handle = self.registry.get_or_load(id).await.map_err(|e| e.to_string())?;
        Ok(self.select(&handle))
    }

    async fn cmd_import(&mut self, args: &[&str]) -> Result<Vec<String>, String> {
        let path = args.first().ok_or("usage: import <file>")?;
        let text = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| format!("cannot read {path}: {e}"))?;
        let handle = self.registry.import_pgn(&text).await.map_err(|e| e.to_string())?;
        Ok(self.select(&handle))
    }

    async fn cmd_move(&mut self, args: &[&str]) -> Result<Vec<String>, String> {
        let [player, text] = args else {
            return Err("usage: move <player> <move>".to_string());
        };
        let id = self.current.ok_or("no game selected")?;
        let handle = self.selected().await?;
        let position = handle.read(|g| g.position().clone()).await.map_err(|e| e.to_string())?;
        let mv = parse_move(&position, text)?;

        let outcome = self
            .registry
            .submit_move(id, &mv, &PlayerId::new(*player))
            .await
            .map_err(|e| e.to_string())?;
        Ok(vec![format!(
            "ok {} revision {} status {}",
            outcome.mv, outcome.revision, outcome.status
        )])
    }

    async fn cmd_end(
        &mut self,
        args: &[&str],
        reason: fn(Color) -> TerminationReason,
    ) -> Result<Vec<String>, String> {
        let color = match args.first() {
            Some(&"white") => Color::White,
            Some(&"black") => Color::Black,
            _ => return Err("expected 'white' or 'black'".to_string()),
        };
        self.terminate(reason(color)).await
    }

    async fn terminate(&mut self, reason: TerminationReason) -> Result<Vec<String>, String> {
        let id = self.current.ok_or("no game selected")?;
        let status = self
            .registry
            .terminate(id, reason)
            .await
            .map_err(|e| e.to_string())?;
        Ok(vec![format!("ok {reason} status {status}")])
    }

    async fn cmd_show(&self) -> Result<Vec<String>, String> {
        let handle = self.selected().await?;
        handle
            .read(|g| {
                let position = g.position();
                vec![
                    position.display(),
                    format!("FEN: {}", position.to_fen()),
                    format!("White: {}  Black: {}", g.white(), g.black()),
                    format!("Status: {} ({:?})", g.status(), g.rules_status()),
                    format!("Revision: {}", g.revision()),
                ]
            })
            .await
            .map_err(|e| e.to_string())
    }

    async fn cmd_moves(&self) -> Result<Vec<String>, String> {
        let handle = self.selected().await?;
        handle
            .read(|g| {
                let position = g.position();
                let moves = g.legal_moves();
                let list: Vec<String> = moves
                    .iter()
                    .map(|m| format!("{}({})", m.to_uci(), san::to_san(position, m)))
                    .collect();
                vec![format!("Legal moves: {}", moves.len()), list.join(" ")]
            })
            .await
            .map_err(|e| e.to_string())
    }

    async fn cmd_pgn(&self) -> Result<Vec<String>, String> {
        let handle = self.selected().await?;
        let game = handle.snapshot().await.map_err(|e| e.to_string())?;
        Ok(vec![pgn::export(&game)])
    }

    async fn cmd_checkpoint(&self) -> Result<Vec<String>, String> {
        let id = self.current.ok_or("no game selected")?;
        let written = self.registry.checkpoint(id).await.map_err(|e| e.to_string())?;
        Ok(vec![if written { "checkpoint written" } else { "already up to date" }.to_string()])
    }

    async fn cmd_evict(&mut self) -> Result<Vec<String>, String> {
        let id = self.current.ok_or("no game selected")?;
        let evicted = self.registry.evict(id).await.map_err(|e| e.to_string())?;
        Ok(vec![if evicted { "evicted" } else { "not live" }.to_string()])
    }

    async fn cmd_perft(&self, args: &[&str]) -> Result<Vec<String>, String> {
        let depth = match args.first() {
            None => 1,
            Some(text) => match text.parse::<usize>() {
                Ok(depth) if (1..=MAX_PERFT_DEPTH).contains(&depth) => depth,
                _ => return Err(format!("usage: perft [depth], depth 1..={MAX_PERFT_DEPTH}")),
            },
        };
        let position = match self.current {
            Some(_) => {
                let handle = self.selected().await?;
                handle.read(|g| g.position().clone()).await.map_err(|e| e.to_string())?
            }
            None => Position::starting(),
        };

        let start = std::time::Instant::now();
        let nodes = tokio::task::spawn_blocking(move || MoveGenerator::new().perft(&position, depth))
            .await
            .map_err(|e| e.to_string())?;
        Ok(vec![format!("Nodes: {nodes} ({:.2}s)", start.elapsed().as_secs_f64())])
    }
}

/// Accept UCI (`e2e4`) first, then SAN (`Nf3`) against `position`.
fn parse_move(position: &Position, text: &str) -> Result<Move, String> {
    Move::from_uci(text).or_else(|_| san::parse_san(position, text).map_err(|e| e.to_string()))
}
