//! États de transport du player.

use std::fmt;

/// État courant de la machine de transport.
///
/// Les transitions externes passent par [`crate::PlayerHandle::request`] ;
/// les transitions internes (fin de piste, curseur épuisé) sont le fait
/// de la boucle principale. Il n'y a pas d'état « inconnu » : une
/// interrogation lit simplement l'état courant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Stop,
    Play,
    Pause,
    /// Transition interne : démonte la piste courante, avance le
    /// curseur, relance.
    Change,
    /// Défaillance fatale : la boucle principale se termine.
    Error,
}

impl State {
    pub fn as_str(&self) -> &'static str {
        match self {
            State::Stop => "stop",
            State::Play => "play",
            State::Pause => "pause",
            State::Change => "change",
            State::Error => "error",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transition demandée de l'extérieur ; retourne l'état cible effectif,
/// ou `None` si la demande n'a pas de sens depuis l'état courant.
pub(crate) fn requested_transition(current: State, want: State) -> Option<State> {
    match (current, want) {
        // Depuis l'arrêt, lire commence par avancer le curseur.
        (State::Stop, State::Play) => Some(State::Change),
        (State::Pause, State::Play) => Some(State::Play),
        (State::Play, State::Pause) => Some(State::Pause),
        (_, State::Stop) => Some(State::Stop),
        (State::Play, State::Change) | (State::Pause, State::Change) => Some(State::Change),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_play_from_stop_goes_through_change() {
        assert_eq!(
            requested_transition(State::Stop, State::Play),
            Some(State::Change)
        );
    }

    #[test]
    fn test_pause_resume() {
        assert_eq!(
            requested_transition(State::Play, State::Pause),
            Some(State::Pause)
        );
        assert_eq!(
            requested_transition(State::Pause, State::Play),
            Some(State::Play)
        );
    }

    #[test]
    fn test_stop_always_allowed() {
        for state in [State::Stop, State::Play, State::Pause, State::Change] {
            assert_eq!(requested_transition(state, State::Stop), Some(State::Stop));
        }
    }

    #[test]
    fn test_nonsense_requests_are_refused() {
        assert_eq!(requested_transition(State::Stop, State::Pause), None);
        assert_eq!(requested_transition(State::Error, State::Play), None);
    }
}
