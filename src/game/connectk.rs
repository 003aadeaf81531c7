use std::fmt::{self, Display};

use crate::game::common::{GameColor, GameMove, GamePlayer, GamePosition, IGame};

pub fn color_to_str(c: Option<GameColor>) -> String {
    match c {
        None => String::from("None"),
        Some(GameColor::Player1) => String::from("X"),
        Some(GameColor::Player2) => String::from("O"),
    }
}

/// Scan directions for a winning line: right, down, down-right, down-left.
const DIRECTIONS: [(isize, isize); 4] = [(0, 1), (1, 0), (1, 1), (1, -1)];

#[derive(Copy, Clone, PartialEq, Eq, Hash, Debug)]
pub struct ConnectKMove<const ROWS: usize, const COLS: usize, const WIN: usize> {
    idx: u8,
}

impl<const ROWS: usize, const COLS: usize, const WIN: usize> ConnectKMove<ROWS, COLS, WIN> {
    pub fn new(r: usize, c: usize) -> Self {
        Self::from_idx(r * COLS + c)
    }

    pub fn from_idx(idx: usize) -> Self {
        assert!(idx < ROWS * COLS);
        Self { idx: idx as u8 }
    }

    pub fn to_idx(&self) -> usize {
        self.idx as usize
    }

    pub fn row(&self) -> usize {
        self.idx as usize / COLS
    }

    pub fn column(&self) -> usize {
        self.idx as usize % COLS
    }
}

impl<const ROWS: usize, const COLS: usize, const WIN: usize> GameMove
    for ConnectKMove<ROWS, COLS, WIN>
{
    type Game = ConnectKGame<ROWS, COLS, WIN>;

    fn to_nn_idx(&self) -> usize {
        self.idx as usize
    }
}

impl<const ROWS: usize, const COLS: usize, const WIN: usize> Display
    for ConnectKMove<ROWS, COLS, WIN>
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.row(), self.column())
    }
}

/// Place-anywhere connect-K board: `WIN` stones of one color in a row,
/// column or diagonal win. Both boards fit in one `u64` word each.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct ConnectKPosition<const ROWS: usize, const COLS: usize, const WIN: usize> {
    board_x: u64,
    board_o: u64,
    turn: GameColor,
    winner: Option<GameColor>,
}

impl<const ROWS: usize, const COLS: usize, const WIN: usize> ConnectKPosition<ROWS, COLS, WIN> {
    /// Board string in row-major order, one char per cell (`x`/`o`/`_`),
    /// followed by the char of the player to move.
    pub fn from_str(s: &str) -> Self {
        let chars = s.chars().collect::<Vec<_>>();
        assert_eq!(chars.len(), ROWS * COLS + 1);

        let mut board_x = 0u64;
        let mut board_o = 0u64;
        for (idx, ch) in chars[..ROWS * COLS].iter().enumerate() {
            match ch {
                'x' => board_x |= 1 << idx,
                'o' => board_o |= 1 << idx,
                '_' => {}
                other => panic!("unknown board char: {}", other),
            }
        }
        let turn = match chars[ROWS * COLS] {
            'x' => GameColor::Player1,
            'o' => GameColor::Player2,
            other => panic!("unknown turn char: {}", other),
        };

        let mut pos = Self {
            board_x,
            board_o,
            turn,
            winner: None,
        };
        pos.check_winner_all();
        pos
    }

    pub fn get_tile(&self, r: usize, c: usize) -> Option<GameColor> {
        assert!(r < ROWS && c < COLS);
        let bit = 1u64 << (r * COLS + c);
        if self.board_x & bit != 0 {
            return Some(GameColor::Player1);
        }
        if self.board_o & bit != 0 {
            return Some(GameColor::Player2);
        }
        None
    }

    pub fn num_moves_played(&self) -> u32 {
        (self.board_x | self.board_o).count_ones()
    }

    pub fn make_move_new(&self, m: ConnectKMove<ROWS, COLS, WIN>) -> Self {
        let mut res = *self;
        res.make_move(m);
        res
    }

    pub fn make_move(&mut self, m: ConnectKMove<ROWS, COLS, WIN>) {
        assert!(self.is_valid_move(m));

        let mover = self.turn;
        let board = match mover {
            GameColor::Player1 => &mut self.board_x,
            GameColor::Player2 => &mut self.board_o,
        };
        *board |= 1u64 << m.to_idx();
        let board = *board;

        if Self::line_through(board, m.row(), m.column()) {
            self.winner = Some(mover);
        }
        self.turn = self.turn.opposite();
    }

    pub fn is_valid_move(&self, m: ConnectKMove<ROWS, COLS, WIN>) -> bool {
        if self.is_over() {
            return false;
        }
        (self.board_x | self.board_o) & (1u64 << m.to_idx()) == 0
    }

    /// Is the placed stone at (r, c) part of a WIN-long line of `board`?
    fn line_through(board: u64, r: usize, c: usize) -> bool {
        let occupied = |r: isize, c: isize| {
            r >= 0
                && r < ROWS as isize
                && c >= 0
                && c < COLS as isize
                && board & (1u64 << (r as usize * COLS + c as usize)) != 0
        };

        for (dr, dc) in DIRECTIONS {
            let mut count = 1;
            for mult in [1isize, -1] {
                let mut nr = r as isize + dr * mult;
                let mut nc = c as isize + dc * mult;
                while occupied(nr, nc) {
                    count += 1;
                    if count >= WIN {
                        return true;
                    }
                    nr += dr * mult;
                    nc += dc * mult;
                }
            }
        }
        false
    }

    /// Full-board winner scan, used when a position is built from scratch
    /// rather than move by move.
    fn check_winner_all(&mut self) {
        self.winner = None;
        for r in 0..ROWS {
            for c in 0..COLS {
                let bit = 1u64 << (r * COLS + c);
                if self.board_x & bit != 0 && Self::line_through(self.board_x, r, c) {
                    self.winner = Some(GameColor::Player1);
                    return;
                }
                if self.board_o & bit != 0 && Self::line_through(self.board_o, r, c) {
                    self.winner = Some(GameColor::Player2);
                    return;
                }
            }
        }
    }
}

impl<const ROWS: usize, const COLS: usize, const WIN: usize> GamePosition
    for ConnectKPosition<ROWS, COLS, WIN>
{
    type Game = ConnectKGame<ROWS, COLS, WIN>;

    fn new() -> Self {
        assert!(ROWS * COLS <= 64, "board must fit in a u64 bitboard");
        assert!(WIN > 1 && WIN <= ROWS.max(COLS));
        Self {
            board_x: 0,
            board_o: 0,
            turn: GameColor::Player1,
            winner: None,
        }
    }

    fn get_turn(&self) -> GameColor {
        self.turn
    }

    fn get_legal_moves(&self) -> Vec<ConnectKMove<ROWS, COLS, WIN>> {
        if self.is_over() {
            return vec![];
        }
        let occupied = self.board_x | self.board_o;
        (0..ROWS * COLS)
            .filter(|idx| occupied & (1u64 << idx) == 0)
            .map(ConnectKMove::from_idx)
            .collect()
    }

    fn get_moved_position(&self, m: ConnectKMove<ROWS, COLS, WIN>) -> Self {
        self.make_move_new(m)
    }

    fn is_over(&self) -> bool {
        self.winner.is_some() || self.num_moves_played() as usize == ROWS * COLS
    }

    fn get_winner(&self) -> Option<GameColor> {
        assert!(self.is_over());
        self.winner
    }

    /// One-hot cell-state planes: empty, then O stones, then X stones.
    fn observation_tensor(&self) -> Vec<f32> {
        let cells = ROWS * COLS;
        let mut tensor = vec![0.0; 3 * cells];
        for idx in 0..cells {
            let bit = 1u64 << idx;
            let plane = if self.board_o & bit != 0 {
                1
            } else if self.board_x & bit != 0 {
                2
            } else {
                0
            };
            tensor[plane * cells + idx] = 1.0;
        }
        tensor
    }

    fn print(&self) {
        for r in 0..ROWS {
            let row = (0..COLS)
                .map(|c| match self.get_tile(r, c) {
                    Some(GameColor::Player1) => 'x',
                    Some(GameColor::Player2) => 'o',
                    None => '_',
                })
                .collect::<String>();
            println!("{}", row);
        }
        println!("turn: {}", color_to_str(Some(self.turn)));
    }
}

pub struct ConnectKGame<const ROWS: usize, const COLS: usize, const WIN: usize> {
    pos: ConnectKPosition<ROWS, COLS, WIN>,
}

impl<const ROWS: usize, const COLS: usize, const WIN: usize> IGame
    for ConnectKGame<ROWS, COLS, WIN>
{
    type Position = ConnectKPosition<ROWS, COLS, WIN>;
    type Move = ConnectKMove<ROWS, COLS, WIN>;

    const MOVES_NUM: usize = ROWS * COLS;
    const OBS_SIZE: usize = 3 * ROWS * COLS;

    fn new() -> Self {
        Self::new_from_pos(ConnectKPosition::new())
    }

    fn new_from_pos(pos: Self::Position) -> Self {
        Self { pos }
    }

    fn get_position(&self) -> &Self::Position {
        &self.pos
    }

    fn is_over(&self) -> bool {
        self.pos.is_over()
    }

    fn get_winner(&self) -> Option<GameColor> {
        self.pos.get_winner()
    }

    fn play_single_turn(&mut self, next_move: Self::Move) {
        self.pos.make_move(next_move);
    }

    fn play_until_over(
        &mut self,
        player1: &mut dyn GamePlayer<Self>,
        player2: &mut dyn GamePlayer<Self>,
    ) -> (Self::Position, Option<GameColor>) {
        while !self.is_over() {
            let next_move = match self.pos.get_turn() {
                GameColor::Player1 => player1.next_move(&self.pos),
                GameColor::Player2 => player2.next_move(&self.pos),
            };
            let Some(next_move) = next_move else {
                break;
            };
            self.play_single_turn(next_move);
        }
        let winner = if self.is_over() { self.get_winner() } else { None };
        (self.pos, winner)
    }
}
