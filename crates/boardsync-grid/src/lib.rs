//! Reference rules engine: a 3x3 grid where two sides alternately claim
//! squares and three in a row wins.
//!
//! Squares are named `a1`..`c3` (file then rank). The snapshot is the JSON
//! encoding of the full state, including move history and headers, so
//! equal snapshots mean equal states.

use std::collections::BTreeMap;

use boardsync_core::{OperationError, Piece, RulesEngine, Side, Snapshot};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// The only piece kind this engine knows.
pub const MARK: &str = "mark";

const LINES: [[usize; 3]; 8] = [
    [0, 1, 2],
    [3, 4, 5],
    [6, 7, 8],
    [0, 3, 6],
    [1, 4, 7],
    [2, 5, 8],
    [0, 4, 8],
    [2, 4, 6],
];

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GridEngine {
    cells: [Option<Side>; 9],
    turn: Side,
    history: Vec<usize>,
    headers: BTreeMap<String, String>,
}

/// Wire form of the state. Field order is fixed, so serialization is
/// canonical.
#[derive(Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
struct GridState {
    board: String,
    turn: Side,
    history: Vec<String>,
    headers: BTreeMap<String, String>,
}

impl Default for GridEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl GridEngine {
    pub fn new() -> Self {
        Self {
            cells: [None; 9],
            turn: Side::First,
            history: Vec::new(),
            headers: BTreeMap::new(),
        }
    }

    pub fn boxed() -> Box<dyn RulesEngine> {
        Box::new(Self::new())
    }

    /// Side holding `square`, if any.
    pub fn cell(&self, square: &str) -> Result<Option<Side>, OperationError> {
        Ok(self.cells[parse_square(square)?])
    }

    pub fn winner(&self) -> Option<Side> {
        LINES.iter().find_map(|line| {
            let first = self.cells[line[0]]?;
            line.iter()
                .all(|&i| self.cells[i] == Some(first))
                .then_some(first)
        })
    }

    pub fn headers(&self) -> &BTreeMap<String, String> {
        &self.headers
    }

    fn is_full(&self) -> bool {
        self.cells.iter().all(Option::is_some)
    }

    fn to_state(&self) -> GridState {
        GridState {
            board: self.cells.iter().map(|c| side_char(*c)).collect(),
            turn: self.turn,
            history: self.history.iter().map(|&i| square_name(i)).collect(),
            headers: self.headers.clone(),
        }
    }

    fn from_state(state: GridState) -> Result<Self, OperationError> {
        let chars: Vec<char> = state.board.chars().collect();
        if chars.len() != 9 {
            return Err(OperationError::InvalidArgument(format!(
                "board must have 9 cells, got {}",
                chars.len()
            )));
        }
        let mut cells = [None; 9];
        for (cell, c) in cells.iter_mut().zip(chars) {
            *cell = parse_side_char(c)?;
        }

        let mut history = Vec::with_capacity(state.history.len());
        for square in &state.history {
            let index = parse_square(square)?;
            if cells[index].is_none() || history.contains(&index) {
                return Err(OperationError::InvalidArgument(format!(
                    "history entry {square} does not match the board"
                )));
            }
            history.push(index);
        }

        Ok(Self {
            cells,
            turn: state.turn,
            history,
            headers: state.headers,
        })
    }

    fn claim(&mut self, square: &str) -> Result<Value, OperationError> {
        if RulesEngine::is_game_over(self) {
            return Err(OperationError::Rejected("game is over".into()));
        }
        let index = parse_square(square)?;
        if self.cells[index].is_some() {
            return Err(OperationError::Rejected(format!("{square} is occupied")));
        }
        let side = self.turn;
        self.cells[index] = Some(side);
        self.history.push(index);
        self.turn = side.opponent();
        Ok(json!({ "square": square_name(index), "side": side }))
    }
}

impl RulesEngine for GridEngine {
    fn make_move(&mut self, action: &str) -> Result<Value, OperationError> {
        self.claim(action)
    }

    fn undo(&mut self) -> Result<Value, OperationError> {
        let Some(&index) = self.history.last() else {
            return Err(OperationError::Rejected("nothing to undo".into()));
        };
        let Some(side) = self.cells[index] else {
            return Err(OperationError::Rejected("history does not match the board".into()));
        };
        let _ = self.history.pop();
        self.cells[index] = None;
        self.turn = side;
        Ok(json!({ "square": square_name(index), "side": side }))
    }

    fn reset(&mut self) -> Result<(), OperationError> {
        let headers = std::mem::take(&mut self.headers);
        *self = Self::new();
        self.headers = headers;
        Ok(())
    }

    fn clear(&mut self) -> Result<(), OperationError> {
        *self = Self::new();
        Ok(())
    }

    fn load(&mut self, snapshot: &Snapshot) -> Result<(), OperationError> {
        let state: GridState = serde_json::from_str(snapshot.as_str())
            .map_err(|e| OperationError::InvalidArgument(format!("bad snapshot: {e}")))?;
        *self = Self::from_state(state)?;
        Ok(())
    }

    fn remove(&mut self, square: &str) -> Result<Option<Piece>, OperationError> {
        let index = parse_square(square)?;
        let Some(side) = self.cells[index].take() else {
            return Ok(None);
        };
        self.history.clear();
        Ok(Some(Piece {
            kind: MARK.to_owned(),
            side,
        }))
    }

    fn put(&mut self, piece: &Piece, square: &str) -> Result<(), OperationError> {
        if piece.kind != MARK {
            return Err(OperationError::InvalidArgument(format!(
                "unknown piece kind {:?}",
                piece.kind
            )));
        }
        let index = parse_square(square)?;
        self.cells[index] = Some(piece.side);
        self.history.clear();
        Ok(())
    }

    fn load_history(&mut self, history: &str) -> Result<(), OperationError> {
        let mut replay = Self::new();
        replay.headers = self.headers.clone();
        for (n, square) in history.split_whitespace().enumerate() {
            replay.claim(square).map_err(|e| {
                OperationError::Rejected(format!("history move {} ({square}): {e}", n + 1))
            })?;
        }
        *self = replay;
        Ok(())
    }

    fn set_headers(
        &mut self,
        headers: &BTreeMap<String, String>,
    ) -> Result<BTreeMap<String, String>, OperationError> {
        self.headers
            .extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(self.headers.clone())
    }

    fn snapshot(&self) -> Snapshot {
        Snapshot::new(serde_json::to_string(&self.to_state()).unwrap_or_default())
    }

    fn turn(&self) -> Side {
        self.turn
    }

    fn is_game_over(&self) -> bool {
        self.winner().is_some() || self.is_full()
    }
}

fn parse_square(square: &str) -> Result<usize, OperationError> {
    let invalid = || OperationError::InvalidArgument(format!("no such square: {square:?}"));
    let bytes = square.as_bytes();
    if bytes.len() != 2 {
        return Err(invalid());
    }
    let file = match bytes[0] {
        b'a'..=b'c' => usize::from(bytes[0] - b'a'),
        _ => return Err(invalid()),
    };
    let rank = match bytes[1] {
        b'1'..=b'3' => usize::from(bytes[1] - b'1'),
        _ => return Err(invalid()),
    };
    Ok(rank * 3 + file)
}

fn square_name(index: usize) -> String {
    let file = char::from(b'a' + (index % 3) as u8);
    let rank = char::from(b'1' + (index / 3) as u8);
    format!("{file}{rank}")
}

fn side_char(cell: Option<Side>) -> char {
    match cell {
        None => '.',
        Some(Side::First) => 'x',
        Some(Side::Second) => 'o',
    }
}

fn parse_side_char(c: char) -> Result<Option<Side>, OperationError> {
    match c {
        '.' => Ok(None),
        'x' => Ok(Some(Side::First)),
        'o' => Ok(Some(Side::Second)),
        other => Err(OperationError::InvalidArgument(format!(
            "unknown cell {other:?}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn play(engine: &mut GridEngine, moves: &[&str]) {
        for m in moves {
            engine.make_move(m).unwrap();
        }
    }

    #[test]
    fn squares_round_trip_names() {
        for i in 0..9 {
            assert_eq!(parse_square(&square_name(i)).unwrap(), i);
        }
        assert!(parse_square("d1").is_err());
        assert!(parse_square("a4").is_err());
        assert!(parse_square("a").is_err());
    }

    #[test]
    fn moves_alternate_sides() {
        let mut g = GridEngine::new();
        assert_eq!(g.turn(), Side::First);
        let result = g.make_move("b2").unwrap();
        assert_eq!(result["side"], "first");
        assert_eq!(g.turn(), Side::Second);
        assert_eq!(g.cell("b2").unwrap(), Some(Side::First));
    }

    #[test]
    fn occupied_square_is_rejected_without_change() {
        let mut g = GridEngine::new();
        play(&mut g, &["a1"]);
        let before = g.snapshot();
        let err = g.make_move("a1").unwrap_err();
        assert_eq!(err.error_kind(), "rejected");
        assert_eq!(g.snapshot(), before);
    }

    #[test]
    fn bad_square_is_invalid_argument() {
        let mut g = GridEngine::new();
        assert_eq!(g.make_move("z9").unwrap_err().error_kind(), "invalid_argument");
    }

    #[test]
    fn three_in_a_row_ends_the_game() {
        let mut g = GridEngine::new();
        play(&mut g, &["a1", "a2", "b1", "b2", "c1"]);
        assert!(g.is_game_over());
        assert_eq!(g.winner(), Some(Side::First));
        assert!(g.make_move("c3").is_err());
    }

    #[test]
    fn full_board_draw_is_game_over() {
        let mut g = GridEngine::new();
        play(
            &mut g,
            &["a1", "b1", "c1", "b2", "a2", "c2", "b3", "a3", "c3"],
        );
        assert_eq!(g.winner(), None);
        assert!(g.is_game_over());
    }

    #[test]
    fn undo_restores_previous_state() {
        let mut g = GridEngine::new();
        play(&mut g, &["a1"]);
        let before = g.snapshot();
        play(&mut g, &["b2"]);
        let undone = g.undo().unwrap();
        assert_eq!(undone["square"], "b2");
        assert_eq!(g.snapshot(), before);
        assert_eq!(g.turn(), Side::Second);
    }

    #[test]
    fn undo_on_empty_history_is_rejected() {
        let mut g = GridEngine::new();
        assert!(g.undo().is_err());
    }

    #[test]
    fn snapshot_load_reproduces_state() {
        let mut g = GridEngine::new();
        play(&mut g, &["a1", "c3"]);
        let _ = g.set_headers(&BTreeMap::from([("event".into(), "demo".into())]));

        let mut other = GridEngine::new();
        other.load(&g.snapshot()).unwrap();
        assert_eq!(other, g);
        assert_eq!(other.snapshot(), g.snapshot());
    }

    #[test]
    fn load_rejects_garbage_and_keeps_state() {
        let mut g = GridEngine::new();
        play(&mut g, &["a1"]);
        let before = g.snapshot();
        assert!(g.load(&Snapshot::new("not json")).is_err());
        assert!(g
            .load(&Snapshot::new(
                r#"{"board":"x........","turn":"second","history":["b2"],"headers":{}}"#
            ))
            .is_err());
        assert_eq!(g.snapshot(), before);
    }

    #[test]
    fn load_history_replays_from_start() {
        let mut g = GridEngine::new();
        g.load_history("a1 b2 c3").unwrap();
        let mut expected = GridEngine::new();
        play(&mut expected, &["a1", "b2", "c3"]);
        assert_eq!(g, expected);
    }

    #[test]
    fn load_history_is_all_or_nothing() {
        let mut g = GridEngine::new();
        play(&mut g, &["b2"]);
        let before = g.snapshot();
        assert!(g.load_history("a1 a1").is_err());
        assert_eq!(g.snapshot(), before);
    }

    #[test]
    fn put_and_remove_edit_the_board() {
        let mut g = GridEngine::new();
        play(&mut g, &["a1"]);
        let piece = Piece {
            kind: MARK.into(),
            side: Side::Second,
        };
        g.put(&piece, "c3").unwrap();
        assert_eq!(g.cell("c3").unwrap(), Some(Side::Second));
        assert!(g.undo().is_err());

        assert_eq!(g.remove("c3").unwrap(), Some(piece));
        assert_eq!(g.remove("c3").unwrap(), None);
    }

    #[test]
    fn put_rejects_unknown_kind() {
        let mut g = GridEngine::new();
        let piece = Piece {
            kind: "king".into(),
            side: Side::First,
        };
        assert!(g.put(&piece, "a1").is_err());
    }

    #[test]
    fn reset_keeps_headers_clear_drops_them() {
        let mut g = GridEngine::new();
        play(&mut g, &["a1"]);
        let _ = g.set_headers(&BTreeMap::from([("site".into(), "home".into())]));

        g.reset().unwrap();
        assert_eq!(g.cell("a1").unwrap(), None);
        assert_eq!(g.headers().get("site").map(String::as_str), Some("home"));

        g.clear().unwrap();
        assert!(g.headers().is_empty());
    }

    #[test]
    fn set_headers_merges() {
        let mut g = GridEngine::new();
        let _ = g.set_headers(&BTreeMap::from([("a".into(), "1".into())]));
        let merged = g
            .set_headers(&BTreeMap::from([("b".into(), "2".into())]))
            .unwrap();
        assert_eq!(merged.len(), 2);
    }
}
