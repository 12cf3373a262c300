/*!
# Trames NMEA 0183 du récepteur GPS

Seule la trame `$GPRMC` est exploitée :

```text
$GPRMC,134724,A,4217.6448,N,08342.6906,W,001.0,231.8,180510,006.6,W*7F
       hhmmss   latitude    longitude   vitesse cap ddmmyy
```

Champs utilisés : heure (1), statut A/V (2), latitude (3), N/S (4),
longitude (5), E/W (6), date (9). La somme de contrôle n'est pas vérifiée.

Les tampons sont bornés comme sur le récepteur d'origine : une trame fait
au plus 128 octets, une trame découpée au plus 20 champs de 18 caractères.
Un champ trop long interrompt le découpage, il n'est jamais tronqué.
*/

use chrono::NaiveDate;

/// Taille du tampon d'assemblage d'une trame (octets)
pub const MAX_SENTENCE_LEN: usize = 128;

/// Nombre maximum de champs conservés par trame
pub const MAX_NMEA_FIELDS: usize = 20;

/// Taille d'un champ, terminateur compris (héritée du format du récepteur)
pub const MAX_NMEA_FIELD_SIZE: usize = 20;

pub const GPRMC_TAG: &str = "$GPRMC";

const CR: u8 = 0x0D;

/// Commandes d'initialisation envoyées au récepteur Garmin, dans l'ordre.
///
/// La séquence `\r,\n` en fin de commande est celle qu'attend le récepteur.
pub const INIT_COMMANDS: [&[u8]; 4] = [
    // Désactive toutes les trames de sortie
    b"$PGRMO,,2\x0D,\x0A",
    // Paramètres divers du récepteur
    b"$PGRMC,A,,,,,,,,A,3,,2,4,\x0D,\x0A",
    b"$PGRMC1,1,1,,,,,1,A,N,,,,2,\x0D,\x0A",
    // Active uniquement $GPRMC
    b"$PGRMO,GPRMC,1\x0D,\x0A",
];

/// Trame NMEA complète, terminée par LF et commençant par `$`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Sentence(heapless::Vec<u8, MAX_SENTENCE_LEN>);

impl Sentence {
    /// Construit une trame validée ; `None` si elle ne commence pas par `$`
    /// ou dépasse la taille maximale
    pub fn from_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.first() != Some(&b'$') {
            return None;
        }
        heapless::Vec::from_slice(bytes).ok().map(Sentence)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Représentation lisible pour les logs (sans CR/LF)
    pub fn display(&self) -> String {
        String::from_utf8_lossy(&self.0).trim_end().to_string()
    }
}

pub type NmeaField = heapless::String<MAX_NMEA_FIELD_SIZE>;

/// Champs d'une trame découpée sur les virgules
///
/// L'indice 0 est l'identifiant de la trame (`$GPRMC`). Les champs absents
/// sont des chaînes vides.
#[derive(Debug, Clone)]
pub struct NmeaFields {
    fields: [NmeaField; MAX_NMEA_FIELDS],
}

impl NmeaFields {
    pub fn empty() -> Self {
        NmeaFields {
            fields: std::array::from_fn(|_| NmeaField::new()),
        }
    }

    /// Champ `index`, chaîne vide si hors limites ou non renseigné
    pub fn get(&self, index: usize) -> &str {
        self.fields.get(index).map(|f| f.as_str()).unwrap_or("")
    }

    pub fn tag(&self) -> &str {
        self.get(0)
    }
}

/// Découpe une trame en champs séparés par des virgules.
///
/// Le découpage s'arrête sur CR (la somme de contrôle et le champ en cours
/// sont ignorés), en fin de données, quand un champ atteint sa taille
/// maximale, ou après `MAX_NMEA_FIELDS` champs.
pub fn parse_sentence(sentence: &[u8]) -> NmeaFields {
    let mut fields = NmeaFields::empty();
    let mut bytes = sentence.iter().copied();
    let mut field_index = 0;

    'fields: while field_index < MAX_NMEA_FIELDS {
        let mut field = NmeaField::new();
        loop {
            if field.len() >= MAX_NMEA_FIELD_SIZE - 1 {
                break 'fields;
            }
            let ch = match bytes.next() {
                Some(ch) => ch,
                None => break 'fields,
            };
            if ch == CR {
                break 'fields;
            }
            if ch == b',' {
                break;
            }
            if field.push(ch as char).is_err() {
                break 'fields;
            }
        }
        fields.fields[field_index] = field;
        field_index += 1;
    }

    fields
}

/// Convertit la date (`DDMMYY`) et l'heure (`HHMMSS[.sss]`) d'une trame
/// `$GPRMC` en secondes depuis 1970 (UTC).
///
/// L'année sur deux chiffres est interprétée comme 2000 + YY, sans gestion
/// du passage de siècle.
pub fn convert_to_secs(date: &str, time: &str) -> Option<i64> {
    let two_digits = |s: &str, at: usize| -> Option<u32> { s.get(at..at + 2)?.parse().ok() };

    let day = two_digits(date, 0)?;
    let month = two_digits(date, 2)?;
    let year = two_digits(date, 4)?;
    let hours = two_digits(time, 0)?;
    let minutes = two_digits(time, 2)?;
    let seconds = two_digits(time, 4)?;

    let datetime = NaiveDate::from_ymd_opt(2000 + year as i32, month, day)?
        .and_hms_opt(hours, minutes, seconds)?;

    Some(datetime.and_utc().timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    const VALID_RMC: &[u8] =
        b"$GPRMC,134724,A,4217.6448,N,08342.6906,W,001.0,231.8,180510,006.6,W*7F\r\n";

    #[test]
    fn test_parse_gprmc_fields() {
        let fields = parse_sentence(VALID_RMC);

        assert_eq!(fields.tag(), "$GPRMC");
        assert_eq!(fields.get(1), "134724");
        assert_eq!(fields.get(2), "A");
        assert_eq!(fields.get(3), "4217.6448");
        assert_eq!(fields.get(4), "N");
        assert_eq!(fields.get(5), "08342.6906");
        assert_eq!(fields.get(6), "W");
        assert_eq!(fields.get(9), "180510");
        assert_eq!(fields.get(10), "006.6");
        // Le dernier champ est interrompu par CR : il n'est pas conservé
        assert_eq!(fields.get(11), "");
        assert_eq!(fields.get(19), "");
        assert_eq!(fields.get(42), "");
    }

    #[test]
    fn test_parse_empty_fields() {
        let fields = parse_sentence(b"$GPRMC,135251,V,,,,,,,180510,,*60\r\n");
        assert_eq!(fields.get(2), "V");
        assert_eq!(fields.get(3), "");
        assert_eq!(fields.get(9), "180510");
    }

    #[test]
    fn test_oversized_field_stops_parsing() {
        // 18 caractères : conservé
        let fields = parse_sentence(b"$X,123456789012345678,B,\r\n");
        assert_eq!(fields.get(1), "123456789012345678");
        assert_eq!(fields.get(2), "B");

        // 19 caractères : le découpage s'arrête, rien n'est tronqué
        let fields = parse_sentence(b"$X,1234567890123456789,B,\r\n");
        assert_eq!(fields.tag(), "$X");
        assert_eq!(fields.get(1), "");
        assert_eq!(fields.get(2), "");
    }

    #[test]
    fn test_field_count_is_bounded() {
        let many = b"$T,1,2,3,4,5,6,7,8,9,10,11,12,13,14,15,16,17,18,19,20,21,\r\n";
        let fields = parse_sentence(many);
        assert_eq!(fields.get(19), "19");
        assert_eq!(fields.get(20), "");
    }

    #[test]
    fn test_convert_to_secs() {
        let expected = Utc.with_ymd_and_hms(2010, 5, 18, 13, 47, 24).unwrap().timestamp();
        assert_eq!(convert_to_secs("180510", "134724"), Some(expected));
        assert_eq!(convert_to_secs("180510", "134724.000"), Some(expected));
    }

    #[test]
    fn test_convert_to_secs_two_digit_year() {
        // 99 → 2099, pas de gestion de siècle
        let expected = Utc.with_ymd_and_hms(2099, 12, 31, 23, 59, 59).unwrap().timestamp();
        assert_eq!(convert_to_secs("311299", "235959"), Some(expected));
    }

    #[test]
    fn test_convert_to_secs_rejects_bad_fields() {
        assert_eq!(convert_to_secs("", "134724"), None);
        assert_eq!(convert_to_secs("1805", "134724"), None);
        assert_eq!(convert_to_secs("180510", "1347"), None);
        assert_eq!(convert_to_secs("321310", "134724"), None);
    }

    #[test]
    fn test_sentence_validation() {
        assert!(Sentence::from_bytes(VALID_RMC).is_some());
        assert!(Sentence::from_bytes(b"GPRMC,1\r\n").is_none());
        assert!(Sentence::from_bytes(&[b'$'; MAX_SENTENCE_LEN + 1]).is_none());
    }

    #[test]
    fn test_init_commands_select_gprmc_last() {
        assert!(INIT_COMMANDS[0].starts_with(b"$PGRMO,,2"));
        assert!(INIT_COMMANDS[3].starts_with(b"$PGRMO,GPRMC,1"));
    }
}
